pub mod logger;
pub mod pool;
pub mod signals;
