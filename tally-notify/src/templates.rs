use tally_shared::money::format_amount;
use tally_shared::{NotificationEvent, NotificationPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContent {
    pub subject: String,
    pub body: String,
}

/// A pre-approved WhatsApp template and its positional body parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhatsAppTemplate {
    pub name: &'static str,
    pub params: Vec<String>,
}

fn amount(payload: &NotificationPayload) -> String {
    payload
        .amount
        .map(|minor| format_amount(minor, &payload.currency))
        .unwrap_or_default()
}

/// Only customer events with an approved WhatsApp template have an entry here.
pub fn whatsapp_template(event: NotificationEvent, payload: &NotificationPayload) -> Option<WhatsAppTemplate> {
    let name = payload.customer_name.clone();
    let number = payload.order_number.clone();

    let (template, params) = match event {
        NotificationEvent::OrderCreated => ("order_created", vec![name, number, amount(payload)]),
        NotificationEvent::PaymentApproved => ("payment_approved", vec![name, number, amount(payload)]),
        NotificationEvent::OrderShipped => ("order_shipped", vec![name, number]),
        NotificationEvent::OrderDelivered => ("order_delivered", vec![name, number]),
        NotificationEvent::OrderCancelled => ("order_cancelled", vec![name, number]),
        NotificationEvent::PaymentReminder => ("payment_reminder", vec![name, number, amount(payload)]),
        NotificationEvent::PaymentRejected
        | NotificationEvent::AdminApprovalRequested
        | NotificationEvent::ReceiptSubmitted => return None,
    };

    Some(WhatsAppTemplate { name: template, params })
}

/// Free-form body. Also the WhatsApp fallback when the template send fails.
pub fn text(event: NotificationEvent, payload: &NotificationPayload) -> String {
    let name = &payload.customer_name;
    let number = &payload.order_number;
    let total = amount(payload);

    match event {
        NotificationEvent::OrderCreated => format!(
            "Hi {name}, we received your order {number} for {total}. We will let you know as soon as your payment is confirmed."
        ),
        NotificationEvent::PaymentApproved => format!(
            "Hi {name}, your payment of {total} for order {number} has been confirmed. We are preparing your order."
        ),
        NotificationEvent::PaymentRejected => format!(
            "Hi {name}, we could not verify the payment for order {number}. Please contact us or place the order again."
        ),
        NotificationEvent::OrderShipped => format!("Hi {name}, order {number} is on its way."),
        NotificationEvent::OrderDelivered => format!("Hi {name}, order {number} has been delivered. Thank you for shopping with us."),
        NotificationEvent::OrderCancelled => format!("Hi {name}, order {number} has been cancelled."),
        NotificationEvent::PaymentReminder => format!(
            "Hi {name}, order {number} is still waiting for payment of {total}. Please upload your payment receipt to complete it."
        ),
        NotificationEvent::AdminApprovalRequested | NotificationEvent::ReceiptSubmitted => admin_text(event, payload),
    }
}

fn admin_text(event: NotificationEvent, payload: &NotificationPayload) -> String {
    let headline = match event {
        NotificationEvent::ReceiptSubmitted => "A payment receipt was uploaded",
        _ => "A new order is waiting for payment approval",
    };

    let mut lines = vec![
        format!("{}.", headline),
        format!("Order: {}", payload.order_number),
        format!("Customer: {}", payload.customer_name),
        format!("Amount: {}", amount(payload)),
    ];
    if let Some(method) = &payload.payment_method {
        lines.push(format!("Payment method: {}", method));
    }
    if let Some(url) = &payload.approve_url {
        lines.push(format!("Approve: {}", url));
    }
    if let Some(url) = &payload.reject_url {
        lines.push(format!("Reject: {}", url));
    }
    lines.push("These links expire 24 hours after the order was placed and work once.".to_string());
    lines.join("\n")
}

pub fn email(event: NotificationEvent, payload: &NotificationPayload) -> EmailContent {
    let number = &payload.order_number;
    let subject = match event {
        NotificationEvent::OrderCreated => format!("Order {} received", number),
        NotificationEvent::PaymentApproved => format!("Payment confirmed for order {}", number),
        NotificationEvent::PaymentRejected => format!("Payment not verified for order {}", number),
        NotificationEvent::OrderShipped => format!("Order {} shipped", number),
        NotificationEvent::OrderDelivered => format!("Order {} delivered", number),
        NotificationEvent::OrderCancelled => format!("Order {} cancelled", number),
        NotificationEvent::PaymentReminder => format!("Payment pending for order {}", number),
        NotificationEvent::AdminApprovalRequested => format!("[Action required] Approve order {}", number),
        NotificationEvent::ReceiptSubmitted => format!("[Action required] Receipt uploaded for order {}", number),
    };

    EmailContent {
        subject,
        body: text(event, payload),
    }
}
