use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use tally_catalog::StockLedger;
use tally_core::{OrderGuard, Store};
use tally_notify::{NotificationDispatcher, Recipients};
use tally_shared::{
    AdminAction, AdminActionLog, AdminActionOutcome, Customer, NotificationEvent,
    NotificationPayload, Order, OrderItem, OrderStatus, PaymentMethod, PaymentReceipt,
    ShippingAddress, StockLine, StockState,
};

use crate::error::{OrderError, OrderResult};
use crate::receipt::ReceiptPolicy;
use crate::tokens::{ApprovalClaims, ApprovalTokenService, TokenRejection};

/// Bound on compare-and-swap retries when a transition keeps losing to
/// concurrent writers of the same order.
const MAX_SWAP_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub admin_email: String,
    /// Network origin bound into issued tokens
    pub admin_origin: String,
    /// Base of the approve/reject links, e.g. `https://shop.example/api`
    pub public_base_url: String,
    pub currency: String,
    pub receipts: ReceiptPolicy,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer: Customer,
    /// Products and quantities only; name and price come from the catalog.
    pub items: Vec<StockLine>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
}

/// Outcome of a transition that may be repeated.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub order: Order,
    /// The transition had already been applied by an earlier call; nothing changed.
    pub already_processed: bool,
}

impl Resolution {
    fn applied(order: Order) -> Self {
        Self { order, already_processed: false }
    }

    fn repeated(order: Order) -> Self {
        Self { order, already_processed: true }
    }
}

/// Owns the order lifecycle.
///
/// Every transition is a compare-and-swap against the stored order, so two
/// requests for the same order never both apply. Stock settles only after the
/// swap is won, which makes decrement and release happen at most once per order.
pub struct OrderStateMachine {
    store: Arc<dyn Store>,
    ledger: StockLedger,
    tokens: Arc<ApprovalTokenService>,
    notifier: Arc<NotificationDispatcher>,
    settings: MachineSettings,
}

impl OrderStateMachine {
    pub fn new(
        store: Arc<dyn Store>,
        tokens: Arc<ApprovalTokenService>,
        notifier: Arc<NotificationDispatcher>,
        settings: MachineSettings,
    ) -> Self {
        Self {
            ledger: StockLedger::new(store.clone()),
            store,
            tokens,
            notifier,
            settings,
        }
    }

    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    pub async fn get_order(&self, order_id: Uuid) -> OrderResult<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))
    }

    pub async fn orders_for_customer(&self, customer_id: &str) -> OrderResult<Vec<Order>> {
        Ok(self.store.list_orders(customer_id).await?)
    }

    /// Reserve stock and record the order. Cash on delivery is committed and
    /// approved at once; bank transfers and wallets wait for an admin decision.
    pub async fn create_order(&self, new: NewOrder) -> OrderResult<Order> {
        validate_new_order(&new)?;
        let items = self.price_items(&new.items).await?;

        let mut order = Order::new(
            new.customer,
            items,
            new.shipping_address,
            new.payment_method,
            self.settings.currency.clone(),
        )
        .ok_or_else(|| OrderError::Validation("order total exceeds the supported amount".to_string()))?;

        let lines = order.stock_lines();
        self.ledger.reserve_stock(&lines).await?;

        if order.payment_method == PaymentMethod::CashOnDelivery {
            if let Err(e) = self.ledger.decrement_stock(&lines).await {
                self.undo_stock(&order).await;
                return Err(e.into());
            }
            order.stock_state = StockState::Committed;
            order.update_status(OrderStatus::Approved);
        } else if order.payment_method.requires_admin_approval() {
            if let Err(e) = self.issue_tokens(&mut order) {
                self.undo_stock(&order).await;
                return Err(e);
            }
        }

        if let Err(e) = self.store.insert_order(&order).await {
            error!("Failed to save order {}: {}", order.order_number, e);
            self.undo_stock(&order).await;
            return Err(e.into());
        }

        info!(
            "Order {} created ({}, {}, status {})",
            order.order_number,
            order.payment_method.label(),
            tally_shared::money::format_amount(order.total_amount, &order.currency),
            order.status
        );

        if order.has_pending_tokens() {
            self.notify_admin(&order, NotificationEvent::AdminApprovalRequested).await;
        }
        self.notify_customer(&order, NotificationEvent::OrderCreated).await;

        Ok(order)
    }

    /// Snapshot name and price from the catalog. A line asking for more units
    /// than the product stocks is refused before any counter moves.
    async fn price_items(&self, lines: &[StockLine]) -> OrderResult<Vec<OrderItem>> {
        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            let product = self
                .ledger
                .get(line.product_id)
                .await?
                .ok_or_else(|| OrderError::Validation(format!("unknown product {}", line.product_id)))?;

            if line.quantity > product.stock {
                let available = product.available();
                return Err(OrderError::InsufficientStock {
                    product_id: product.product_id,
                    product_name: product.name,
                    requested: line.quantity,
                    available,
                    deficit: line.quantity - available,
                });
            }
            items.push(OrderItem::new(product.product_id, product.name, product.price, line.quantity));
        }
        Ok(items)
    }

    fn issue_tokens(&self, order: &mut Order) -> OrderResult<()> {
        let approve = self.tokens.generate(
            order.id,
            AdminAction::Approve,
            &self.settings.admin_email,
            &self.settings.admin_origin,
        )?;
        let reject = self.tokens.generate(
            order.id,
            AdminAction::Reject,
            &self.settings.admin_email,
            &self.settings.admin_origin,
        )?;

        order.approval_token_expires = Some(approve.expires_at);
        order.approval_token = Some(approve.token);
        order.rejection_token = Some(reject.token);
        Ok(())
    }

    /// Return whatever this order holds in the ledger. Used when the order
    /// itself could not be recorded.
    async fn undo_stock(&self, order: &Order) {
        let lines = order.stock_lines();
        let result = match order.stock_state {
            StockState::Reserved => self.ledger.release_stock(&lines).await,
            StockState::Committed => self.ledger.restock(&lines).await,
            StockState::Released => Ok(()),
        };
        if let Err(e) = result {
            error!("Failed to return stock of unsaved order {}: {}", order.order_number, e);
        }
    }

    /// Attach proof of payment to a pending order.
    pub async fn submit_receipt(&self, order_id: Uuid, file_name: &str, bytes: Vec<u8>) -> OrderResult<Order> {
        let order = self.get_order(order_id).await?;

        if order.receipt.is_some() {
            return Err(OrderError::Conflict("a receipt was already submitted for this order".to_string()));
        }
        if order.status != OrderStatus::Pending {
            return Err(OrderError::Conflict(format!("order is {}", order.status)));
        }
        let kind = self.settings.receipts.validate(file_name, &bytes)?;

        let mut next = order.clone();
        next.receipt = Some(PaymentReceipt {
            file_name: base_name(file_name).to_string(),
            content_type: kind.content_type().to_string(),
            size_bytes: bytes.len() as u64,
            uploaded_at: Utc::now(),
        });
        next.update_status(OrderStatus::ReceiptSubmitted);

        if !self.store.swap_order(&OrderGuard::of(&order), &next).await? {
            return Err(OrderError::Conflict("order changed while the receipt was uploading".to_string()));
        }

        if let Err(e) = self.store.put_receipt(order_id, bytes).await {
            error!("Failed to store receipt for order {}: {}", order.order_number, e);
            self.revert(&next, &order).await;
            return Err(e.into());
        }

        info!("Receipt ({}) submitted for order {}", kind.content_type(), next.order_number);
        self.notify_admin(&next, NotificationEvent::ReceiptSubmitted).await;
        Ok(next)
    }

    pub async fn receipt(&self, order_id: Uuid) -> OrderResult<(PaymentReceipt, Vec<u8>)> {
        let order = self.get_order(order_id).await?;
        let meta = order.receipt.ok_or(OrderError::NotFound(order_id))?;
        let bytes = self
            .store
            .get_receipt(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))?;
        Ok((meta, bytes))
    }

    pub async fn approve_order(&self, order_id: Uuid, token: &str, origin: &str) -> OrderResult<Resolution> {
        self.resolve(order_id, token, AdminAction::Approve, origin).await
    }

    pub async fn reject_order(&self, order_id: Uuid, token: &str, origin: &str) -> OrderResult<Resolution> {
        self.resolve(order_id, token, AdminAction::Reject, origin).await
    }

    async fn resolve(&self, order_id: Uuid, token: &str, action: AdminAction, origin: &str) -> OrderResult<Resolution> {
        let mut order = self.get_order(order_id).await?;

        let claims = match self.tokens.inspect_at(token, order_id, Utc::now()) {
            Ok(claims) => claims,
            Err(rejection) => return Err(self.refuse(order_id, action, None, origin, rejection).await),
        };
        if claims.act != action {
            return Err(self
                .refuse(order_id, action, Some(&claims), origin, TokenRejection::ActionMismatch)
                .await);
        }

        for _ in 0..MAX_SWAP_ATTEMPTS {
            if !order.has_pending_tokens() {
                return self.already_resolved(order, action, &claims, origin).await;
            }

            // Single use: only the token currently stored on the order counts
            let stored = match action {
                AdminAction::Approve => order.approval_token.as_deref(),
                AdminAction::Reject => order.rejection_token.as_deref(),
            };
            if stored != Some(token) {
                return Err(self
                    .refuse(order_id, action, Some(&claims), origin, TokenRejection::StaleToken)
                    .await);
            }
            if !order.status.awaits_admin() {
                return Err(OrderError::Conflict(format!("order is {}", order.status)));
            }

            let mut next = order.clone();
            next.clear_approval_tokens();
            match action {
                AdminAction::Approve => {
                    next.stock_state = StockState::Committed;
                    next.update_status(OrderStatus::Approved);
                }
                AdminAction::Reject => {
                    next.stock_state = StockState::Released;
                    next.update_status(OrderStatus::Rejected);
                }
            }

            if !self.store.swap_order(&OrderGuard::of(&order), &next).await? {
                order = self.get_order(order_id).await?;
                continue;
            }

            let lines = order.stock_lines();
            let settled = match (action, order.stock_state) {
                (AdminAction::Approve, StockState::Reserved) => self.ledger.decrement_stock(&lines).await,
                (AdminAction::Reject, StockState::Reserved) => self.ledger.release_stock(&lines).await,
                _ => Ok(()),
            };
            if let Err(e) = settled {
                error!("Stock settlement failed for order {}: {}", order.order_number, e);
                // The link stays usable once the order is restored
                self.revert(&next, &order).await;
                return Err(e.into());
            }

            self.audit(order_id, action, AdminActionOutcome::Applied, Some(&claims), origin, None)
                .await;
            info!("Order {} {} by {}", next.order_number, next.status, claims.adm);

            let event = match action {
                AdminAction::Approve => NotificationEvent::PaymentApproved,
                AdminAction::Reject => NotificationEvent::PaymentRejected,
            };
            self.notify_customer(&next, event).await;
            return Ok(Resolution::applied(next));
        }

        Err(OrderError::Conflict("order is being modified concurrently, try again".to_string()))
    }

    /// The tokens are gone: either this decision was already taken (idempotent
    /// success) or the order went another way.
    async fn already_resolved(
        &self,
        order: Order,
        action: AdminAction,
        claims: &ApprovalClaims,
        origin: &str,
    ) -> OrderResult<Resolution> {
        let same_decision = match action {
            AdminAction::Approve => order.status.is_approved_track(),
            AdminAction::Reject => order.status == OrderStatus::Rejected,
        };

        if same_decision {
            self.audit(order.id, action, AdminActionOutcome::AlreadyResolved, Some(claims), origin, None)
                .await;
            return Ok(Resolution::repeated(order));
        }

        let reason = format!("order_{}", order.status);
        self.audit(order.id, action, AdminActionOutcome::Refused, Some(claims), origin, Some(&reason))
            .await;
        Err(OrderError::Conflict(format!("order is already {}", order.status)))
    }

    /// Record a refused attempt and produce the one error every refusal maps to.
    async fn refuse(
        &self,
        order_id: Uuid,
        action: AdminAction,
        claims: Option<&ApprovalClaims>,
        origin: &str,
        rejection: TokenRejection,
    ) -> OrderError {
        warn!(
            "Refused {} of order {} from {}: {}",
            action.as_str(),
            order_id,
            origin,
            rejection.as_str()
        );
        self.audit(order_id, action, AdminActionOutcome::Refused, claims, origin, Some(rejection.as_str()))
            .await;
        OrderError::TokenInvalid
    }

    async fn audit(
        &self,
        order_id: Uuid,
        action: AdminAction,
        outcome: AdminActionOutcome,
        claims: Option<&ApprovalClaims>,
        origin: &str,
        reason: Option<&str>,
    ) {
        let mut entry = AdminActionLog::new(order_id, action, outcome);
        entry.admin_email = claims.map(|c| c.adm.clone());
        entry.origin = Some(origin.to_string());
        entry.reason = reason.map(str::to_string);

        if let Err(e) = self.store.append_admin_action(&entry).await {
            error!("Failed to write admin action log for order {}: {}", order_id, e);
        }
    }

    pub async fn audit_trail(&self, order_id: Uuid) -> OrderResult<Vec<AdminActionLog>> {
        self.get_order(order_id).await?;
        Ok(self.store.admin_actions_for_order(order_id).await?)
    }

    /// Cancel from any non-terminal state. Reserved units go back to the pool;
    /// units already sold stay sold.
    pub async fn cancel_order(&self, order_id: Uuid) -> OrderResult<Resolution> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let order = self.get_order(order_id).await?;
            if order.status == OrderStatus::Cancelled {
                return Ok(Resolution::repeated(order));
            }
            if order.status.is_terminal() {
                return Err(OrderError::Conflict(format!("order is already {}", order.status)));
            }

            let mut next = order.clone();
            next.clear_approval_tokens();
            if next.stock_state == StockState::Reserved {
                next.stock_state = StockState::Released;
            }
            next.update_status(OrderStatus::Cancelled);

            if !self.store.swap_order(&OrderGuard::of(&order), &next).await? {
                continue;
            }

            if order.stock_state == StockState::Reserved {
                if let Err(e) = self.ledger.release_stock(&order.stock_lines()).await {
                    error!("Failed to release stock of order {}: {}", order.order_number, e);
                    self.revert(&next, &order).await;
                    return Err(e.into());
                }
            }

            info!("Order {} cancelled (was {})", next.order_number, order.status);
            self.notify_customer(&next, NotificationEvent::OrderCancelled).await;
            return Ok(Resolution::applied(next));
        }

        Err(OrderError::Conflict("order is being modified concurrently, try again".to_string()))
    }

    /// Move an approved order one step along `processing → shipped → delivered`.
    pub async fn advance_fulfillment(&self, order_id: Uuid, target: OrderStatus) -> OrderResult<Resolution> {
        if !matches!(target, OrderStatus::Processing | OrderStatus::Shipped | OrderStatus::Delivered) {
            return Err(OrderError::Validation(format!("{} is not a fulfillment status", target)));
        }

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let order = self.get_order(order_id).await?;
            if order.status == target {
                return Ok(Resolution::repeated(order));
            }
            if order.status.next_fulfillment_step() != Some(target) {
                return Err(OrderError::Conflict(format!(
                    "cannot move order from {} to {}",
                    order.status, target
                )));
            }

            let mut next = order.clone();
            next.update_status(target);
            if !self.store.swap_order(&OrderGuard::of(&order), &next).await? {
                continue;
            }

            info!("Order {} is now {}", next.order_number, target);
            match target {
                OrderStatus::Shipped => self.notify_customer(&next, NotificationEvent::OrderShipped).await,
                OrderStatus::Delivered => self.notify_customer(&next, NotificationEvent::OrderDelivered).await,
                _ => {}
            }
            return Ok(Resolution::applied(next));
        }

        Err(OrderError::Conflict("order is being modified concurrently, try again".to_string()))
    }

    /// Nudge the customer of an order still waiting for payment. Returns the
    /// number of jobs enqueued.
    pub async fn send_payment_reminder(&self, order_id: Uuid) -> OrderResult<usize> {
        let order = self.get_order(order_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(OrderError::Conflict(format!(
                "reminders are only sent for pending orders, this one is {}",
                order.status
            )));
        }

        let jobs = self
            .notifier
            .enqueue(NotificationEvent::PaymentReminder, &customer_recipients(&order), self.payload(&order))
            .await
            .map_err(|e| OrderError::Internal(e.to_string()))?;
        info!("Payment reminder queued for order {}", order.order_number);
        Ok(jobs.len())
    }

    /// Best-effort undo of a won swap whose follow-up step failed.
    async fn revert(&self, written: &Order, original: &Order) {
        match self.store.swap_order(&OrderGuard::of(written), original).await {
            Ok(true) => {}
            Ok(false) => error!(
                "Could not revert order {}: it changed again in the meantime",
                original.order_number
            ),
            Err(e) => error!("Could not revert order {}: {}", original.order_number, e),
        }
    }

    fn payload(&self, order: &Order) -> NotificationPayload {
        NotificationPayload {
            order_id: order.id,
            order_number: order.order_number.clone(),
            customer_name: order.customer.name.clone(),
            amount: Some(order.total_amount),
            currency: order.currency.clone(),
            payment_method: Some(order.payment_method.label().to_string()),
            approve_url: None,
            reject_url: None,
        }
    }

    fn action_url(&self, order: &Order, action: AdminAction, token: &str) -> String {
        format!(
            "{}/orders/{}/{}?token={}",
            self.settings.public_base_url.trim_end_matches('/'),
            order.id,
            action.as_str(),
            token
        )
    }

    // Notification failures are logged and never fail the transition that triggered them.

    async fn notify_customer(&self, order: &Order, event: NotificationEvent) {
        if let Err(e) = self
            .notifier
            .enqueue(event, &customer_recipients(order), self.payload(order))
            .await
        {
            error!("Failed to enqueue {} for order {}: {}", event, order.order_number, e);
        }
    }

    async fn notify_admin(&self, order: &Order, event: NotificationEvent) {
        let mut payload = self.payload(order);
        payload.approve_url = order
            .approval_token
            .as_deref()
            .map(|t| self.action_url(order, AdminAction::Approve, t));
        payload.reject_url = order
            .rejection_token
            .as_deref()
            .map(|t| self.action_url(order, AdminAction::Reject, t));

        if let Err(e) = self
            .notifier
            .enqueue(event, &Recipients::email(self.settings.admin_email.clone()), payload)
            .await
        {
            error!("Failed to enqueue {} for order {}: {}", event, order.order_number, e);
        }
    }
}

fn customer_recipients(order: &Order) -> Recipients {
    Recipients {
        email: Some(order.customer.email.clone()),
        phone: order
            .customer
            .phone
            .clone()
            .or_else(|| Some(order.shipping_address.phone.clone())),
    }
}

fn base_name(file_name: &str) -> &str {
    file_name.rsplit(['/', '\\']).next().unwrap_or(file_name)
}

fn validate_new_order(new: &NewOrder) -> OrderResult<()> {
    if new.items.is_empty() {
        return Err(OrderError::Validation("order has no items".to_string()));
    }
    for line in &new.items {
        if line.quantity <= 0 {
            return Err(OrderError::Validation(format!(
                "quantity for product {} must be positive",
                line.product_id
            )));
        }
    }
    if new.customer.email.trim().is_empty() {
        return Err(OrderError::Validation("customer e-mail is required".to_string()));
    }
    Ok(())
}
