use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEventType {
    Created,
    Updated,
    Paid,
    Shipped,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Paid,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Returned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    /// Decimal amount kept as text so no precision is lost in transit.
    pub price: String,
}

/// An order lifecycle event as carried on the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: String,
    pub user_id: String,
    pub event_type: OrderEventType,
    pub order_status: OrderStatus,
    pub total_amount: String,
    pub currency: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    pub payment_method: Option<String>,
    pub shipping_address: Option<String>,
}

impl OrderEvent {
    /// A bare `CREATED`/`PENDING` event, mostly useful in tests and demos.
    pub fn created(order_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            user_id: user_id.into(),
            event_type: OrderEventType::Created,
            order_status: OrderStatus::Pending,
            total_amount: "0.00".to_string(),
            currency: "USD".to_string(),
            items: Vec::new(),
            created_at: None,
            updated_at: None,
            payment_method: None,
            shipping_address: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_is_camel_case() {
        let mut event = OrderEvent::created("o1", "u1");
        event.items.push(OrderItem {
            product_id: "p1".to_string(),
            product_name: "Widget".to_string(),
            quantity: 2,
            price: "9.99".to_string(),
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["orderId"], "o1");
        assert_eq!(value["eventType"], "CREATED");
        assert_eq!(value["orderStatus"], "PENDING");
        assert_eq!(value["items"][0]["productName"], "Widget");
    }

    #[test]
    fn test_parses_external_payload() {
        let payload = json!({
            "orderId": "o42",
            "userId": "u7",
            "eventType": "PAID",
            "orderStatus": "PAID",
            "totalAmount": "120.50",
            "currency": "EUR",
            "createdAt": "2024-03-01T10:15:00",
            "paymentMethod": "card"
        });

        let event: OrderEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.order_id, "o42");
        assert_eq!(event.order_status, OrderStatus::Paid);
        assert!(event.items.is_empty());
        assert!(event.created_at.is_some());
        assert_eq!(event.updated_at, None);
    }
}
