pub mod encode;
pub mod retrieve;
