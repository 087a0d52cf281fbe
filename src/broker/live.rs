// =============================================================================
// Live broker — synchronous vendor client + market socket thread
// =============================================================================
//
// Every REST method here blocks and is only ever called through
// ThreadOffload. Login is the vendor's two-step headless flow: a TOTP
// derived from the shared seed obtains a view token, then the numeric PIN
// upgrades it to a session token. Calls that fail with an auth-shaped error
// drop the session and retry once after a fresh login, which defuses the
// silent 8-hour session expiry.
//
// The market socket runs on a dedicated background thread (the "SDK
// thread") with a short read timeout so it can interleave outbound
// subscription frames. It only ever touches the FeedCallbacks handed to
// `start_feed`.
// =============================================================================

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::{self, stream::MaybeTlsStream, Message, WebSocket};
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{info, warn};

use crate::broker::{BrokerAdapter, BrokerReply, FeedCallbacks, OrderParams, PositionRow};
use crate::data::instruments::Instrument;
use crate::error::{EngineError, Result};
use crate::settings::Settings;
use crate::types::EngineMode;

/// Read timeout on the socket; bounds the latency of outbound frames and
/// the stop check.
const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(500);

// ── Pure wire helpers (unit-tested) ─────────────────────────────────────

fn val_u64(v: &Value, key: &str) -> Option<u64> {
    match v.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn val_i64(v: &Value, key: &str) -> Option<i64> {
    match v.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn val_f64(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Numeric fields are stringified on this wire.
fn build_order_payload(params: &OrderParams) -> Value {
    json!({
        "exchange_segment": params.exchange_segment,
        "trading_symbol": params.trading_symbol,
        "instrument_token": params.instrument_token.to_string(),
        "transaction_type": params.side.wire(),
        "quantity": params.quantity.to_string(),
        "price": if params.price > 0.0 { format!("{:.2}", params.price) } else { "0".to_string() },
        "order_type": params.order_type.wire(),
        "product": params.product,
        "validity": params.validity,
    })
}

fn parse_reply(raw: Value) -> BrokerReply {
    BrokerReply {
        stat: raw
            .get("stat")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
        order_id: raw
            .get("nOrdNo")
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        err_msg: raw
            .get("errMsg")
            .and_then(|s| s.as_str())
            .map(str::to_string),
        raw,
    }
}

fn parse_position_rows(raw: &Value) -> Vec<PositionRow> {
    let Some(rows) = raw.get("data").and_then(|d| d.as_array()) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let token = val_u64(row, "instrumentToken").or_else(|| val_u64(row, "tk"))? as u32;
            Some(PositionRow {
                token,
                trading_symbol: row
                    .get("tradingSymbol")
                    .or_else(|| row.get("trdSym"))
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string(),
                net_qty: val_i64(row, "netQty").unwrap_or(0),
                avg_price: val_f64(row, "avgPrice").unwrap_or(0.0),
                realized_pnl: val_f64(row, "rlzdPnl").unwrap_or(0.0),
                buy_amount: val_f64(row, "buyAmt").unwrap_or(0.0),
                sell_amount: val_f64(row, "sellAmt").unwrap_or(0.0),
            })
        })
        .collect()
}

fn parse_instruments(raw: &Value) -> Vec<Instrument> {
    let Some(rows) = raw.as_array().or_else(|| raw.get("data").and_then(|d| d.as_array()))
    else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let token = val_u64(row, "tk")? as u32;
            let trading_symbol = row.get("trdSym")?.as_str()?.to_string();
            Some(Instrument {
                token,
                symbol: row
                    .get("sym")
                    .and_then(|s| s.as_str())
                    .unwrap_or(&trading_symbol)
                    .to_string(),
                trading_symbol,
                lot_size: val_u64(row, "lotSz").unwrap_or(1).max(1),
                tick_size: val_f64(row, "tckSz").unwrap_or(0.05),
                freeze_qty: val_u64(row, "frzQty")
                    .unwrap_or(crate::data::instruments::DEFAULT_FREEZE_QTY),
                segment: row
                    .get("seg")
                    .and_then(|s| s.as_str())
                    .unwrap_or("nse_cm")
                    .to_string(),
                price_precision: val_u64(row, "lPrecision").unwrap_or(2) as u32,
            })
        })
        .collect()
}

/// Vendor auth failures arrive as assorted messages; match the known shapes.
fn is_auth_error(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    [
        "unauthorized",
        "invalid session",
        "session expired",
        "authentication failed",
        "invalid token",
        "401",
        "not logged in",
        "login required",
    ]
    .iter()
    .any(|k| lower.contains(k))
}

// ── Session & feed state ────────────────────────────────────────────────

#[derive(Default)]
struct Session {
    session_token: String,
}

struct FeedHandle {
    stop: Arc<AtomicBool>,
    commands: Sender<String>,
}

pub struct LiveBroker {
    http: reqwest::blocking::Client,
    api_base: String,
    ws_url: String,
    consumer_key: String,
    ucc: String,
    mobile: String,
    pin: String,
    totp_seed: String,
    session: Mutex<Session>,
    logged_in: AtomicBool,
    feed: Mutex<Option<FeedHandle>>,
}

impl LiveBroker {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::TransientBroker(format!("http client: {e}")))?;
        Ok(Self {
            http,
            api_base: settings.broker_api_base.clone(),
            ws_url: settings.broker_ws_url.clone(),
            consumer_key: settings.broker_consumer_key.clone(),
            ucc: settings.broker_ucc.clone(),
            mobile: settings.broker_mobile.clone(),
            pin: settings.broker_pin.clone(),
            totp_seed: settings.broker_totp_seed.clone(),
            session: Mutex::new(Session::default()),
            logged_in: AtomicBool::new(false),
            feed: Mutex::new(None),
        })
    }

    fn totp_now(&self) -> Result<String> {
        let secret = Secret::Encoded(self.totp_seed.clone())
            .to_bytes()
            .map_err(|e| EngineError::Auth(format!("bad TOTP seed: {e:?}")))?;
        let totp = TOTP::new(Algorithm::SHA1, 6, 1, 30, secret)
            .map_err(|e| EngineError::Auth(format!("TOTP init: {e:?}")))?;
        totp.generate_current()
            .map_err(|e| EngineError::Auth(format!("TOTP clock: {e}")))
    }

    fn post(&self, path: &str, body: Value) -> Result<Value> {
        let token = self.session.lock().session_token.clone();
        let resp = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .header("x-consumer-key", &self.consumer_key)
            .bearer_auth(token)
            .json(&body)
            .send()
            .map_err(|e| EngineError::TransientBroker(format!("POST {path}: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(EngineError::Auth(format!("{path}: HTTP {status}")));
        }
        if status.is_server_error() {
            return Err(EngineError::TransientBroker(format!("{path}: HTTP {status}")));
        }
        resp.json()
            .map_err(|e| EngineError::TransientBroker(format!("{path}: bad JSON: {e}")))
    }

    fn get(&self, path: &str) -> Result<Value> {
        let token = self.session.lock().session_token.clone();
        let resp = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .header("x-consumer-key", &self.consumer_key)
            .bearer_auth(token)
            .send()
            .map_err(|e| EngineError::TransientBroker(format!("GET {path}: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(EngineError::Auth(format!("{path}: HTTP {status}")));
        }
        if status.is_server_error() {
            return Err(EngineError::TransientBroker(format!("{path}: HTTP {status}")));
        }
        resp.json()
            .map_err(|e| EngineError::TransientBroker(format!("{path}: bad JSON: {e}")))
    }

    /// Run a vendor call, forcing one re-login on an auth-shaped failure.
    fn with_session<T>(&self, op: impl Fn(&Self) -> Result<T>) -> Result<T> {
        if !self.is_logged_in() {
            self.login()?;
        }
        match op(self) {
            Err(e) if is_auth_error(&e.to_string()) => {
                warn!(error = %e, "session expired mid-call, re-logging in");
                self.logged_in.store(false, Ordering::Release);
                self.login()?;
                op(self)
            }
            other => other,
        }
    }

    // ── Socket thread ───────────────────────────────────────────────────

    fn socket_loop(
        mut socket: WebSocket<MaybeTlsStream<TcpStream>>,
        callbacks: FeedCallbacks,
        stop: Arc<AtomicBool>,
        commands: mpsc::Receiver<String>,
    ) {
        (callbacks.on_open)();
        loop {
            if stop.load(Ordering::Acquire) {
                let _ = socket.close(None);
                (callbacks.on_close)("stopped".to_string());
                return;
            }

            while let Ok(frame) = commands.try_recv() {
                if let Err(e) = socket.send(Message::Text(frame)) {
                    (callbacks.on_error)(format!("send failed: {e}"));
                }
            }

            match socket.read() {
                Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(payload) => (callbacks.on_message)(payload),
                    Err(e) => (callbacks.on_error)(format!("bad frame: {e}")),
                },
                Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_))
                | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(_)) => {
                    (callbacks.on_close)("server close".to_string());
                    return;
                }
                Err(tungstenite::Error::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    // Read timeout: loop to service commands / stop flag.
                }
                Err(e) => {
                    (callbacks.on_error)(e.to_string());
                    (callbacks.on_close)("read error".to_string());
                    return;
                }
            }
        }
    }
}

impl BrokerAdapter for LiveBroker {
    fn mode(&self) -> EngineMode {
        EngineMode::Live
    }

    fn login(&self) -> Result<()> {
        if self.is_logged_in() {
            return Ok(());
        }
        if self.ucc.is_empty() || self.totp_seed.is_empty() {
            return Err(EngineError::Auth("broker credentials not configured".into()));
        }

        let totp = self.totp_now()?;
        let view = self.post(
            "/login/totp",
            json!({ "mobileNumber": self.mobile, "ucc": self.ucc, "totp": totp }),
        )?;
        if let Some(err) = view.get("error").and_then(|e| e.as_str()) {
            return Err(EngineError::Auth(format!("TOTP login failed: {err}")));
        }
        if let Some(token) = view.get("token").and_then(|t| t.as_str()) {
            self.session.lock().session_token = token.to_string();
        }

        let validated = self.post("/login/validate", json!({ "mpin": self.pin }))?;
        if let Some(err) = validated.get("error").and_then(|e| e.as_str()) {
            return Err(EngineError::Auth(format!("PIN validation failed: {err}")));
        }
        if let Some(token) = validated.get("token").and_then(|t| t.as_str()) {
            self.session.lock().session_token = token.to_string();
        }

        self.logged_in.store(true, Ordering::Release);
        info!(ucc = %self.ucc, "broker session established");
        Ok(())
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    fn place_order(&self, params: OrderParams) -> Result<BrokerReply> {
        self.with_session(|b| {
            let raw = b.post("/orders", build_order_payload(&params))?;
            Ok(parse_reply(raw))
        })
    }

    fn cancel_order(&self, order_id: String) -> Result<BrokerReply> {
        self.with_session(|b| {
            let raw = b.post("/orders/cancel", json!({ "orderId": order_id }))?;
            Ok(parse_reply(raw))
        })
    }

    fn modify_order(&self, order_id: String, price: f64, quantity: u64) -> Result<BrokerReply> {
        self.with_session(|b| {
            let raw = b.post(
                "/orders/modify",
                json!({
                    "orderId": order_id,
                    "price": format!("{price:.2}"),
                    "quantity": quantity.to_string(),
                }),
            )?;
            Ok(parse_reply(raw))
        })
    }

    fn get_positions(&self) -> Result<Vec<PositionRow>> {
        self.with_session(|b| {
            let raw = b.get("/positions?segment=nse_cm")?;
            if raw.get("stat").and_then(|s| s.as_str()) == Some("Not_Ok") {
                let msg = raw
                    .get("errMsg")
                    .and_then(|m| m.as_str())
                    .unwrap_or("positions fetch failed");
                return Err(EngineError::TransientBroker(msg.to_string()));
            }
            Ok(parse_position_rows(&raw))
        })
    }

    fn get_limits(&self) -> Result<f64> {
        self.with_session(|b| {
            let raw = b.get("/limits?segment=nse_cm")?;
            Ok(val_f64(&raw, "net")
                .or_else(|| val_f64(&raw, "cash"))
                .unwrap_or(0.0))
        })
    }

    fn subscribe(&self, tokens: Vec<u32>) -> Result<()> {
        let frame = json!({
            "type": "subscribe",
            "exchange_segment": "nse_cm",
            "instrument_tokens": tokens.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
        })
        .to_string();

        // Queued to the socket thread when connected; otherwise this is a
        // no-op and the feed loop re-issues the set after reconnect.
        if let Some(handle) = self.feed.lock().as_ref() {
            handle
                .commands
                .send(frame)
                .map_err(|_| EngineError::TransientBroker("socket thread gone".into()))?;
        }
        Ok(())
    }

    fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        self.with_session(|b| {
            let raw = b.get("/scripmaster?segment=nse_cm")?;
            let instruments = parse_instruments(&raw);
            if instruments.is_empty() {
                return Err(EngineError::TransientBroker(
                    "scrip master came back empty".into(),
                ));
            }
            Ok(instruments)
        })
    }

    fn start_feed(&self, callbacks: FeedCallbacks) -> Result<()> {
        self.stop_feed();

        let url = format!("{}?token={}", self.ws_url, self.session.lock().session_token);
        let (socket, _response) = tungstenite::connect(url.as_str())
            .map_err(|e| EngineError::TransientBroker(format!("socket connect: {e}")))?;

        // A short read timeout lets the thread interleave outbound frames
        // and observe the stop flag.
        match socket.get_ref() {
            MaybeTlsStream::Plain(s) => {
                let _ = s.set_read_timeout(Some(SOCKET_READ_TIMEOUT));
            }
            MaybeTlsStream::NativeTls(t) => {
                let _ = t.get_ref().set_read_timeout(Some(SOCKET_READ_TIMEOUT));
            }
            _ => {}
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<String>();
        *self.feed.lock() = Some(FeedHandle {
            stop: stop.clone(),
            commands: tx,
        });

        std::thread::Builder::new()
            .name("broker-socket".to_string())
            .spawn(move || Self::socket_loop(socket, callbacks, stop, rx))
            .map_err(|e| EngineError::TransientBroker(format!("socket thread: {e}")))?;
        Ok(())
    }

    fn stop_feed(&self) {
        if let Some(handle) = self.feed.lock().take() {
            handle.stop.store(true, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for LiveBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBroker")
            .field("ucc", &self.ucc)
            .field("logged_in", &self.is_logged_in())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    #[test]
    fn order_payload_stringifies_numeric_fields() {
        let params = OrderParams::intraday("RELIANCE-EQ", 2885, Side::Buy, 25, 1500.5);
        let payload = build_order_payload(&params);
        assert_eq!(payload["transaction_type"], "B");
        assert_eq!(payload["quantity"], "25");
        assert_eq!(payload["price"], "1500.50");
        assert_eq!(payload["order_type"], "L");
        assert_eq!(payload["product"], "MIS");
        assert_eq!(payload["validity"], "DAY");
        assert_eq!(payload["instrument_token"], "2885");

        let mkt = build_order_payload(&OrderParams::intraday("TCS-EQ", 11536, Side::Sell, 5, 0.0));
        assert_eq!(mkt["price"], "0");
        assert_eq!(mkt["order_type"], "MKT");
        assert_eq!(mkt["transaction_type"], "S");
    }

    #[test]
    fn reply_parsing_handles_ok_and_not_ok() {
        let ok = parse_reply(json!({ "stat": "Ok", "nOrdNo": "240101000001" }));
        assert!(ok.accepted());
        assert_eq!(ok.order_id.as_deref(), Some("240101000001"));

        let bad = parse_reply(json!({ "stat": "Not_Ok", "errMsg": "RMS check failed" }));
        assert!(!bad.accepted());
        assert_eq!(bad.err_msg.as_deref(), Some("RMS check failed"));
    }

    #[test]
    fn position_rows_parse_stringified_numbers() {
        let raw = json!({
            "stat": "Ok",
            "data": [{
                "instrumentToken": "2885",
                "tradingSymbol": "RELIANCE-EQ",
                "netQty": "-25",
                "avgPrice": "1490.25",
                "rlzdPnl": "-310.5",
                "buyAmt": "37256.25",
                "sellAmt": "36945.75"
            }]
        });
        let rows = parse_position_rows(&raw);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].token, 2885);
        assert_eq!(rows[0].net_qty, -25);
        assert!((rows[0].realized_pnl + 310.5).abs() < 1e-9);
        assert!((rows[0].buy_amount - 37256.25).abs() < 1e-9);
    }

    #[test]
    fn instrument_rows_parse_with_defaults() {
        let raw = json!([
            { "tk": "2885", "trdSym": "RELIANCE-EQ", "sym": "RELIANCE",
              "lotSz": "1", "tckSz": "0.05", "frzQty": "1800", "lPrecision": 2 },
            { "tk": 11536, "trdSym": "TCS-EQ" }
        ]);
        let instruments = parse_instruments(&raw);
        assert_eq!(instruments.len(), 2);
        assert_eq!(instruments[0].freeze_qty, 1800);
        assert_eq!(instruments[1].lot_size, 1);
        assert_eq!(instruments[1].segment, "nse_cm");
    }

    #[test]
    fn auth_error_shapes_are_detected() {
        assert!(is_auth_error("HTTP 401 Unauthorized"));
        assert!(is_auth_error("broker auth failure: Session Expired"));
        assert!(is_auth_error("invalid token presented"));
        assert!(!is_auth_error("HTTP 503 service unavailable"));
        assert!(!is_auth_error("RMS: margin shortfall"));
    }
}
