//! Product, order, and checkout notification types.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// A product as reported by a site driver when it becomes available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    /// Product title.
    pub name: String,

    /// Product page URL.
    #[serde(default)]
    pub url: Option<String>,

    /// Formatted price, including currency.
    #[serde(default)]
    pub price: Option<String>,

    /// Size that was matched.
    #[serde(default)]
    pub size: Option<String>,

    /// Product image URL.
    #[serde(default)]
    pub image: Option<String>,
}

/// An order placed by a successful checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfo {
    /// Site order number.
    pub number: String,

    /// Order status page.
    #[serde(default)]
    pub url: Option<String>,
}

/// Input to notification sinks after a checkout attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSummary {
    pub success: bool,
    pub product: String,
    pub price: Option<String>,
    pub site: String,
    pub profile: String,
    pub size: Option<String>,
    pub image: Option<String>,
    #[serde(default)]
    pub order: Option<OrderInfo>,
}

impl CheckoutSummary {
    /// Render a plain-text summary suitable for chat webhooks and logs.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let title = if self.success {
            "Successful checkout"
        } else {
            "Payment failed"
        };
        writeln!(out, "{title}: {}", self.product).ok();
        writeln!(out, "Site: {}", self.site).ok();
        writeln!(out, "Profile: {}", self.profile).ok();
        writeln!(out, "Size: {}", self.size.as_deref().unwrap_or("N/A")).ok();
        write!(out, "Price: {}", self.price.as_deref().unwrap_or("N/A")).ok();
        if let Some(order) = &self.order {
            write!(out, "\nOrder: {}", order.number).ok();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_success() {
        let summary = CheckoutSummary {
            success: true,
            product: "Dunk Low".to_string(),
            price: Some("$110.00".to_string()),
            site: "Kith".to_string(),
            profile: "main".to_string(),
            size: Some("10".to_string()),
            image: None,
            order: Some(OrderInfo {
                number: "#1001".to_string(),
                url: None,
            }),
        };

        let text = summary.render();
        assert!(text.starts_with("Successful checkout: Dunk Low"));
        assert!(text.contains("Size: 10"));
        assert!(text.contains("Order: #1001"));
    }

    #[test]
    fn test_render_missing_fields() {
        let summary = CheckoutSummary {
            success: false,
            product: "Dunk Low".to_string(),
            price: None,
            site: "Kith".to_string(),
            profile: "main".to_string(),
            size: None,
            image: None,
            order: None,
        };

        let text = summary.render();
        assert!(text.starts_with("Payment failed"));
        assert!(text.contains("Price: N/A"));
        assert!(!text.contains("Order:"));
    }
}
