//! Translation between wire field names and the domain model.
//!
//! Every Notion property name and Gumroad sale field name lives here. The
//! source database's email column carries a leading byte-order mark in its
//! name, so the defaults reproduce it exactly; operators with a clean schema
//! override the names through [`PropertyNames`].

use chrono::{DateTime, Utc};
use gumsync_core::{CustomerRecord, Money, NewRecord, ProductRef, RecordId, RecordPatch, SaleEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

pub const DEFAULT_EMAIL_PROPERTY: &str = "\u{feff}email address";
pub const DEFAULT_TOTAL_SPENT_PROPERTY: &str = "price spent";
pub const DEFAULT_SUBSCRIBED_PROPERTY: &str = "subscribed";
pub const DEFAULT_PRODUCTS_PROPERTY: &str = "purchased products";

const MISSING_ID: &str = "<missing id>";

/// A row that could not be mapped onto the domain model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("item {item_id}: field {field:?} {reason}")]
pub struct SchemaMismatch {
    pub item_id: String,
    pub field: String,
    pub reason: String,
}

impl SchemaMismatch {
    fn new(item_id: &str, field: &str, reason: impl Into<String>) -> Self {
        Self {
            item_id: item_id.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Notion database property names for each customer field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyNames {
    pub email: String,
    pub total_spent: String,
    pub subscribed: String,
    pub purchased_products: String,
}

impl Default for PropertyNames {
    fn default() -> Self {
        Self {
            email: DEFAULT_EMAIL_PROPERTY.to_string(),
            total_spent: DEFAULT_TOTAL_SPENT_PROPERTY.to_string(),
            subscribed: DEFAULT_SUBSCRIBED_PROPERTY.to_string(),
            purchased_products: DEFAULT_PRODUCTS_PROPERTY.to_string(),
        }
    }
}

impl PropertyNames {
    /// Maps a Notion page object onto a [`CustomerRecord`].
    pub fn decode_page(&self, page: &JsonValue) -> Result<CustomerRecord, SchemaMismatch> {
        let id = json_str(page, &["id"]).ok_or_else(|| SchemaMismatch::new(MISSING_ID, "id", "is missing"))?;
        let created_raw = json_str(page, &["created_time"])
            .ok_or_else(|| SchemaMismatch::new(id, "created_time", "is missing"))?;
        let created_at = parse_timestamp(created_raw)
            .ok_or_else(|| SchemaMismatch::new(id, "created_time", format!("is not RFC 3339: {created_raw}")))?;

        let props = page
            .get("properties")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| SchemaMismatch::new(id, "properties", "is missing"))?;

        let email = property(props, id, &self.email)?
            .get("email")
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SchemaMismatch::new(id, &self.email, "has no email"))?
            .to_string();

        let amount = property(props, id, &self.total_spent)?
            .get("number")
            .and_then(JsonValue::as_f64)
            .ok_or_else(|| SchemaMismatch::new(id, &self.total_spent, "has no number"))?;
        let total_spent = Money::from_major_units(amount)
            .ok_or_else(|| SchemaMismatch::new(id, &self.total_spent, format!("is out of range: {amount}")))?;

        let subscribed = property(props, id, &self.subscribed)?
            .get("checkbox")
            .and_then(json_bool_lenient)
            .ok_or_else(|| SchemaMismatch::new(id, &self.subscribed, "has no checkbox value"))?;

        let options = property(props, id, &self.purchased_products)?
            .get("multi_select")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| SchemaMismatch::new(id, &self.purchased_products, "has no multi_select"))?;
        let purchased_products = options
            .iter()
            .map(|option| {
                json_str(option, &["name"])
                    .map(ProductRef::new)
                    .ok_or_else(|| SchemaMismatch::new(id, &self.purchased_products, "has an option without a name"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CustomerRecord {
            id: RecordId::new(id),
            email,
            total_spent,
            subscribed,
            purchased_products,
            created_at,
        })
    }

    /// Property payload for creating a page.
    pub fn encode_new_record(&self, record: &NewRecord) -> JsonValue {
        let mut props = self.encode_cumulative(record.total_spent, record.subscribed, &record.purchased_products);
        props.insert(self.email.clone(), json!({ "email": record.email }));
        JsonValue::Object(props)
    }

    /// Property payload for folding duplicates into a survivor. Email is left untouched.
    pub fn encode_patch(&self, patch: &RecordPatch) -> JsonValue {
        JsonValue::Object(self.encode_cumulative(patch.total_spent, patch.subscribed, &patch.purchased_products))
    }

    fn encode_cumulative(&self, total_spent: Money, subscribed: bool, products: &[ProductRef]) -> Map<String, JsonValue> {
        let mut props = Map::new();
        props.insert(self.total_spent.clone(), json!({ "number": total_spent.as_major_units() }));
        props.insert(self.subscribed.clone(), json!({ "checkbox": subscribed }));
        props.insert(
            self.purchased_products.clone(),
            json!({ "multi_select": products.iter().map(|p| json!({ "name": p.name })).collect::<Vec<_>>() }),
        );
        props
    }
}

/// Maps one entry of a Gumroad `sales` array onto a [`SaleEvent`].
///
/// `price` is in minor units; `purchase_email` is preferred over `email`.
pub fn decode_sale(sale: &JsonValue) -> Result<SaleEvent, SchemaMismatch> {
    let id = json_str(sale, &["id"]).unwrap_or(MISSING_ID);

    let price = sale
        .get("price")
        .and_then(json_number_lenient)
        .and_then(Money::from_minor_units_f64)
        .ok_or_else(|| SchemaMismatch::new(id, "price", "is not a number"))?;
    let product_name = json_str(sale, &["product_name"])
        .ok_or_else(|| SchemaMismatch::new(id, "product_name", "is missing"))?
        .to_string();
    let buyer_email = json_str(sale, &["purchase_email"])
        .or_else(|| json_str(sale, &["email"]))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SchemaMismatch::new(id, "purchase_email", "is missing"))?
        .to_string();
    let can_contact = sale.get("can_contact").and_then(json_bool_lenient).unwrap_or(false);
    let created_raw =
        json_str(sale, &["created_at"]).ok_or_else(|| SchemaMismatch::new(id, "created_at", "is missing"))?;
    let created_at = parse_timestamp(created_raw)
        .ok_or_else(|| SchemaMismatch::new(id, "created_at", format!("is not RFC 3339: {created_raw}")))?;

    Ok(SaleEvent {
        price,
        product_name,
        buyer_email,
        can_contact,
        created_at,
    })
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|ts| ts.with_timezone(&Utc))
}

fn property<'a>(props: &'a Map<String, JsonValue>, id: &str, name: &str) -> Result<&'a JsonValue, SchemaMismatch> {
    props.get(name).ok_or_else(|| SchemaMismatch::new(id, name, "is missing"))
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_bool_lenient(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        JsonValue::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn json_number_lenient(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
