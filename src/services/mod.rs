pub mod quota;
pub mod token_pool;
