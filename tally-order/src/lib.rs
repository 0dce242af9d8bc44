pub mod error;
pub mod machine;
pub mod receipt;
pub mod tokens;

pub use error::{OrderError, OrderResult};
pub use machine::{MachineSettings, NewOrder, OrderStateMachine, Resolution};
pub use receipt::{ReceiptError, ReceiptKind, ReceiptPolicy};
pub use tokens::{ApprovalClaims, ApprovalTokenService, IssuedToken, TokenError, TokenRejection};
