pub mod audit;
pub mod notification;
pub mod order;
pub mod product;
