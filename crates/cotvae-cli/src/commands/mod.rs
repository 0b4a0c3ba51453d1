pub mod reform;
pub mod train;
