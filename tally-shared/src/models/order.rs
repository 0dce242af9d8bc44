use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use super::product::StockLine;

/// Order status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    ReceiptSubmitted,
    Approved,
    Rejected,
    Cancelled,
    Processing,
    Shipped,
    Delivered,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::ReceiptSubmitted => "receipt_submitted",
            OrderStatus::Approved => "approved",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Rejected | OrderStatus::Cancelled | OrderStatus::Delivered)
    }

    /// States in which an admin decision is still outstanding.
    pub fn awaits_admin(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::ReceiptSubmitted)
    }

    /// `approved` and every fulfillment state reachable from it.
    pub fn is_approved_track(&self) -> bool {
        matches!(
            self,
            OrderStatus::Approved | OrderStatus::Processing | OrderStatus::Shipped | OrderStatus::Delivered
        )
    }

    /// The single fulfillment step that may follow this status, if any.
    pub fn next_fulfillment_step(&self) -> Option<OrderStatus> {
        match self {
            OrderStatus::Approved => Some(OrderStatus::Processing),
            OrderStatus::Processing => Some(OrderStatus::Shipped),
            OrderStatus::Shipped => Some(OrderStatus::Delivered),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "receipt_submitted" => Ok(OrderStatus::ReceiptSubmitted),
            "approved" => Ok(OrderStatus::Approved),
            "rejected" => Ok(OrderStatus::Rejected),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "processing" => Ok(OrderStatus::Processing),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CashOnDelivery,
    BankTransfer,
    MobileWallet,
    Card,
}

impl PaymentMethod {
    /// Bank transfers and wallets settle outside the gateway and need an admin to
    /// confirm the customer's proof of payment.
    pub fn requires_admin_approval(&self) -> bool {
        matches!(self, PaymentMethod::BankTransfer | PaymentMethod::MobileWallet)
    }

    pub fn label(&self) -> &'static str {
        match self {
            PaymentMethod::CashOnDelivery => "Cash on Delivery",
            PaymentMethod::BankTransfer => "Bank Transfer",
            PaymentMethod::MobileWallet => "Mobile Wallet",
            PaymentMethod::Card => "Card",
        }
    }
}

/// Where the order's units currently sit in the stock ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StockState {
    /// Held in `reservedStock`, not yet sold.
    Reserved,
    /// Decremented from `stock`; final sale.
    Committed,
    /// Returned to the sellable pool.
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShippingAddress {
    pub full_name: String,
    pub phone: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub postal_code: Option<String>,
    pub country: String,
}

/// Metadata of the proof of payment; the bytes live in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// A line of the order with the product's name and price captured at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderItem {
    pub product_id: Uuid,
    pub name: String,
    pub unit_price: i64,
    pub quantity: i64,
}

impl OrderItem {
    pub fn new(product_id: Uuid, name: impl Into<String>, unit_price: i64, quantity: i64) -> Self {
        Self {
            product_id,
            name: name.into(),
            unit_price,
            quantity,
        }
    }

    /// `None` when the product does not fit in an `i64`.
    pub fn line_total(&self) -> Option<i64> {
        self.unit_price.checked_mul(self.quantity)
    }

    pub fn stock_line(&self) -> StockLine {
        StockLine {
            product_id: self.product_id,
            quantity: self.quantity,
        }
    }
}

/// The single source of truth for a customer's purchase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub customer: Customer,
    pub items: Vec<OrderItem>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub currency: String,
    pub total_amount: i64,
    pub status: OrderStatus,
    pub stock_state: StockState,
    pub approval_token: Option<String>,
    pub rejection_token: Option<String>,
    pub approval_token_expires: Option<DateTime<Utc>>,
    pub is_approved: bool,
    pub receipt: Option<PaymentReceipt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Sum of all line totals, or `None` on overflow.
    pub fn total_of(items: &[OrderItem]) -> Option<i64> {
        items
            .iter()
            .try_fold(0i64, |total, item| total.checked_add(item.line_total()?))
    }

    /// Returns `None` when the order total cannot be represented.
    pub fn new(
        customer: Customer,
        items: Vec<OrderItem>,
        shipping_address: ShippingAddress,
        payment_method: PaymentMethod,
        currency: impl Into<String>,
    ) -> Option<Self> {
        let total_amount = Self::total_of(&items)?;
        let now = Utc::now();
        let id = Uuid::new_v4();
        let short = id.simple().to_string()[..6].to_uppercase();

        Some(Self {
            id,
            order_number: format!("ORD-{}-{}", now.format("%Y%m%d"), short),
            customer,
            items,
            shipping_address,
            payment_method,
            currency: currency.into(),
            total_amount,
            status: OrderStatus::Pending,
            stock_state: StockState::Reserved,
            approval_token: None,
            rejection_token: None,
            approval_token_expires: None,
            is_approved: false,
            receipt: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn stock_lines(&self) -> Vec<StockLine> {
        self.items.iter().map(OrderItem::stock_line).collect()
    }

    /// Update order status
    pub fn update_status(&mut self, new_status: OrderStatus) {
        self.status = new_status;
        if new_status == OrderStatus::Approved {
            self.is_approved = true;
        }
        self.updated_at = Utc::now();
    }

    /// Drop both admin capabilities; neither link works after this.
    pub fn clear_approval_tokens(&mut self) {
        self.approval_token = None;
        self.rejection_token = None;
        self.approval_token_expires = None;
    }

    pub fn has_pending_tokens(&self) -> bool {
        self.approval_token.is_some() || self.rejection_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer() -> Customer {
        Customer {
            id: "cust-1".to_string(),
            name: "Ayesha Khan".to_string(),
            email: "ayesha@example.com".to_string(),
            phone: Some("+923001234567".to_string()),
        }
    }

    fn address() -> ShippingAddress {
        ShippingAddress {
            full_name: "Ayesha Khan".to_string(),
            phone: "+923001234567".to_string(),
            line1: "House 12, Street 4".to_string(),
            line2: None,
            city: "Lahore".to_string(),
            postal_code: Some("54000".to_string()),
            country: "PK".to_string(),
        }
    }

    #[test]
    fn test_new_order_totals_items() {
        let items = vec![
            OrderItem::new(Uuid::new_v4(), "Kurta", 250_000, 2),
            OrderItem::new(Uuid::new_v4(), "Dupatta", 80_000, 1),
        ];
        let order = Order::new(customer(), items, address(), PaymentMethod::BankTransfer, "PKR").unwrap();

        assert_eq!(order.total_amount, 580_000);
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.order_number.starts_with("ORD-"));
        assert!(!order.is_approved);
    }

    #[test]
    fn test_total_overflow_is_refused() {
        let product = Uuid::new_v4();
        let huge_price = vec![OrderItem::new(product, "Kurta", i64::MAX, 2)];
        assert_eq!(huge_price[0].line_total(), None);
        assert!(Order::new(customer(), huge_price, address(), PaymentMethod::BankTransfer, "PKR").is_none());

        let many_lines = vec![
            OrderItem::new(product, "Kurta", i64::MAX, 1),
            OrderItem::new(product, "Kurta", 1, 1),
        ];
        assert_eq!(Order::total_of(&many_lines), None);
    }

    #[test]
    fn test_status_flags() {
        assert!(OrderStatus::Delivered.is_terminal());
        assert!(!OrderStatus::Shipped.is_terminal());
        assert!(OrderStatus::ReceiptSubmitted.awaits_admin());
        assert_eq!(OrderStatus::Approved.next_fulfillment_step(), Some(OrderStatus::Processing));
        assert_eq!(OrderStatus::Pending.next_fulfillment_step(), None);
        assert_eq!("receipt_submitted".parse::<OrderStatus>(), Ok(OrderStatus::ReceiptSubmitted));
    }

    #[test]
    fn test_update_status_tracks_approval_flag() {
        let mut order = Order::new(customer(), vec![], address(), PaymentMethod::MobileWallet, "PKR").unwrap();
        order.update_status(OrderStatus::Approved);
        assert!(order.is_approved);
        order.update_status(OrderStatus::Cancelled);
        assert!(order.is_approved, "payment approval survives a later cancellation");
    }

    #[test]
    fn test_payment_method_gate() {
        assert!(PaymentMethod::BankTransfer.requires_admin_approval());
        assert!(PaymentMethod::MobileWallet.requires_admin_approval());
        assert!(!PaymentMethod::CashOnDelivery.requires_admin_approval());
        assert!(!PaymentMethod::Card.requires_admin_approval());
    }
}
