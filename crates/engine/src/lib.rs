pub mod clob;
pub mod lifecycle;
pub mod order_manager;
pub mod position_manager;
pub mod ratelimit;

pub use clob::{ClobClient, PriceStream};
pub use lifecycle::{Engine, EngineHandle};
pub use order_manager::OrderManager;
pub use position_manager::PositionManager;
pub use ratelimit::{ClobRateLimiter, RateLimiterConfig};
