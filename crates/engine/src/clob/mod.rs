pub mod rest;
pub mod stream;

pub use rest::ClobClient;
pub use stream::PriceStream;
