pub mod fixtures;
pub mod listener;
pub mod peripheral;
pub mod temp;
