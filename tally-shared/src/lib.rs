pub mod models;
pub mod money;
pub mod pii;

pub use models::audit::{AdminAction, AdminActionLog, AdminActionOutcome};
pub use models::notification::{
    Channel, DeliveryOutcome, JobStatus, MessageLog, NotificationEvent, NotificationJob,
    NotificationPayload,
};
pub use models::order::{
    Customer, Order, OrderItem, OrderStatus, PaymentMethod, PaymentReceipt, ShippingAddress,
    StockState,
};
pub use models::product::{ProductStock, StockDelta, StockLine};
