// Exchange REST and WebSocket clients
pub mod binance;

pub use binance::BinanceClient;
