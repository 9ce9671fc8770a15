use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a held position. `Zero` doubles as the "no signal" /
/// "close now" marker in [`Signal`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
    Zero,
}

impl PositionSide {
    /// Order side that opens a position in this direction.
    pub fn entry_order_side(self) -> Option<OrderSide> {
        match self {
            PositionSide::Long => Some(OrderSide::Buy),
            PositionSide::Short => Some(OrderSide::Sell),
            PositionSide::Zero => None,
        }
    }

    /// Order side that closes a position held in this direction.
    pub fn exit_order_side(self) -> Option<OrderSide> {
        match self {
            PositionSide::Long => Some(OrderSide::Sell),
            PositionSide::Short => Some(OrderSide::Buy),
            PositionSide::Zero => None,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
            PositionSide::Zero => write!(f, "ZERO"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
    StopMarket,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_filled(self) -> bool {
        self == OrderStatus::Filled
    }
}

/// One kline. `current_price` mirrors `close` on historical rows; on the
/// last row it carries the live ticker price instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub current_price: f64,
}

/// Output of a signal evaluation. On an entry evaluation `Zero` means
/// "do not open"; on an exit evaluation `Zero` means "close now". The
/// reason is a human-auditable checklist, never parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub side: PositionSide,
    pub reason: String,
}

impl Signal {
    pub fn new(side: PositionSide, reason: impl Into<String>) -> Self {
        Self {
            side,
            reason: reason.into(),
        }
    }

    pub fn zero(reason: impl Into<String>) -> Self {
        Self::new(PositionSide::Zero, reason)
    }
}

/// The exchange's authoritative view of a position, as returned by
/// `TradeClient::fetch_position`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub pnl: f64,
}

/// Parameters for placing an order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub close_position: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: f64, reduce_only: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            reduce_only,
            close_position: false,
        }
    }

    pub fn limit(
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        reduce_only: bool,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            reduce_only,
            close_position: false,
        }
    }

    /// Stop-market order that flattens the whole position when triggered.
    pub fn stop_market_close(symbol: &str, side: OrderSide, stop_price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::StopMarket,
            quantity: 0.0,
            price: None,
            stop_price: Some(stop_price),
            reduce_only: false,
            close_position: true,
        }
    }
}

/// Exchange-side view of an order, shared by place and fetch responses.
#[derive(Debug, Clone)]
pub struct OrderState {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    pub price: f64,
    pub avg_price: f64,
    pub executed_qty: f64,
}

/// One raw execution belonging to an order.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeFill {
    pub order_id: i64,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub realized_pnl: f64,
    pub side: OrderSide,
    pub time: DateTime<Utc>,
}

/// Normalized result of aggregating every fill of one order: volume-weighted
/// price, summed fee, summed realized pnl.
#[derive(Debug, Clone, PartialEq)]
pub struct FillSummary {
    pub price: f64,
    pub fee: f64,
    pub realized_pnl: f64,
    pub side: OrderSide,
}
