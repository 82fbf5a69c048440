//! Shop settings and option lists.
//!
//! Read-only configuration the console needs while editing orders: shop
//! identity, VAT registration, and the dynamic option lists (job types,
//! payment methods, teams). Both reads run under the retry wrapper;
//! they are idempotent and a transient failure here would otherwise
//! blank the whole settings screen.

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::retry::{with_retry, RetryOptions};
use crate::store::{Filter, OrderBy, StoreClient};
use crate::{value_f64, value_str};

/// Fetch shop settings merged with the active option lists. `None` when
/// the settings row cannot be read.
///
/// Option lists live in two places for legacy reasons: a JSON column on
/// the settings row and a normalized option-list table. The table is the
/// active storage and wins per category.
pub async fn get_settings<S: StoreClient>(store: &S) -> Option<Value> {
    let (settings, options) = tokio::join!(
        with_retry("get_settings:row", RetryOptions::default(), || async move {
            store
                .select_one("settings", "*", &[Filter::eq("id", "default")])
                .await
        }),
        with_retry("get_settings:options", RetryOptions::default(), || async move {
            store
                .select(
                    "system_options_lists",
                    "*",
                    &[Filter::eq("is_active", true)],
                    Some(&OrderBy::asc("sort_order")),
                )
                .await
        }),
    );

    let data = match settings {
        Ok(row) => row,
        Err(err) => {
            warn!(error = %err, "settings fetch failed");
            return None;
        }
    };
    let option_rows = match options {
        Ok(rows) => rows,
        Err(err) => {
            warn!(error = %err, "option list fetch failed, using JSON column only");
            Vec::new()
        }
    };

    let mut system_options: Map<String, Value> = data
        .get("system_options")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    system_options.insert(
        "shopLat".to_string(),
        data.get("shop_lat").cloned().unwrap_or(Value::Null),
    );
    system_options.insert(
        "shopLon".to_string(),
        data.get("shop_lon").cloned().unwrap_or(Value::Null),
    );

    // Rebuild category arrays from the normalized rows; the table
    // overrides the JSON column wherever both carry a category.
    let mut by_category: Map<String, Value> = Map::new();
    for row in &option_rows {
        let (category, value) = match (
            value_str(row, &["category"]),
            row.get("value").cloned(),
        ) {
            (Some(category), Some(value)) => (category, value),
            _ => continue,
        };
        if let Some(list) = by_category
            .entry(category)
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
        {
            list.push(value);
        }
    }
    for (category, values) in by_category {
        system_options.insert(category, values);
    }

    Some(json!({
        "shopName": data.get("shop_name").cloned().unwrap_or(Value::Null),
        "shopAddress": data.get("shop_address").cloned().unwrap_or(Value::Null),
        "shopPhone": data.get("shop_phone").cloned().unwrap_or(Value::Null),
        "shopEmail": data.get("shop_email").cloned().unwrap_or(Value::Null),
        "shopTaxId": data.get("shop_tax_id").cloned().unwrap_or(Value::Null),
        "vatRegistered": data.get("vat_registered").cloned().unwrap_or(Value::Null),
        "vatRate": value_f64(&data, &["vat_rate"]).unwrap_or(0.07),
        "systemOptions": Value::Object(system_options),
        "promptpayQr": data.get("promptpay_qr").cloned().unwrap_or(Value::Null),
        "quotationDefaultTerms": data.get("quotation_default_terms").cloned().unwrap_or(Value::Null),
        "quotationWarrantyPolicy": data.get("quotation_warranty_policy").cloned().unwrap_or(Value::Null),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use crate::testutil::MemoryStore;
    use serde_json::json;

    fn seed_settings(store: &MemoryStore) {
        store.seed(
            "settings",
            vec![json!({
                "id": "default",
                "shop_name": "ลูเมนโฮม",
                "shop_phone": "053-123456",
                "vat_registered": true,
                "vat_rate": 0.07,
                "shop_lat": 18.79,
                "shop_lon": 98.98,
                "system_options": {
                    "jobTypes": ["installation"],
                    "paymentMethods": ["เงินสด"]
                }
            })],
        );
        store.seed(
            "system_options_lists",
            vec![
                json!({ "category": "jobTypes", "value": "installation", "is_active": true, "sort_order": 1 }),
                json!({ "category": "jobTypes", "value": "delivery", "is_active": true, "sort_order": 2 }),
                json!({ "category": "teams", "value": "ทีม A", "is_active": true, "sort_order": 1 }),
            ],
        );
    }

    #[tokio::test]
    async fn test_option_table_overrides_json_column() {
        let store = MemoryStore::new();
        seed_settings(&store);

        let settings = get_settings(&store).await.expect("settings");
        assert_eq!(settings["shopName"], json!("ลูเมนโฮม"));
        // Table wins for jobTypes, JSON column survives for categories
        // the table does not carry.
        assert_eq!(
            settings["systemOptions"]["jobTypes"],
            json!(["installation", "delivery"])
        );
        assert_eq!(settings["systemOptions"]["paymentMethods"], json!(["เงินสด"]));
        assert_eq!(settings["systemOptions"]["teams"], json!(["ทีม A"]));
        assert_eq!(settings["systemOptions"]["shopLat"], json!(18.79));
    }

    #[tokio::test]
    async fn test_missing_settings_row_yields_none() {
        let store = MemoryStore::new();
        assert!(get_settings(&store).await.is_none());
    }

    #[tokio::test]
    async fn test_option_list_failure_degrades_to_json_column() {
        let store = MemoryStore::new();
        seed_settings(&store);
        store.fail_next("system_options_lists", StoreError::Other("boom".into()));

        let settings = get_settings(&store).await.expect("settings");
        assert_eq!(settings["systemOptions"]["jobTypes"], json!(["installation"]));
        assert!(settings["systemOptions"].get("teams").is_none());
    }
}
