// Content flattening
// Typed extracted fields <-> flat dot-notation key/value pairs

//! Nested objects become `parent.child` keys, arrays become `parent.<index>`
//! keys and every scalar is rendered as a plain string. Nulls are omitted.
//!
//! [`unflatten`] walks the per-type schema to rebuild the original value, so
//! a string field stays a string even when its text looks like a number.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use super::document::{ContentEntry, DocumentType};
use super::extraction::{fields_schema, ExtractedFields};
use crate::schema::{Schema, ValidationError, ValidationErrorKind};
use crate::Result;

/// Flatten typed fields into content entries, ordered by key
pub fn flatten(fields: &ExtractedFields) -> Result<Vec<ContentEntry>> {
    let mut entries = Vec::new();
    flatten_value("", &fields.to_value()?, &mut entries);
    Ok(entries)
}

fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", prefix, segment)
    }
}

fn flatten_value(prefix: &str, value: &Value, out: &mut Vec<ContentEntry>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, member) in map {
                flatten_value(&join(prefix, key), member, out);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_value(&join(prefix, &index.to_string()), item, out);
            }
        }
        Value::String(s) => out.push(ContentEntry::new(prefix, s.clone())),
        Value::Number(n) => out.push(ContentEntry::new(prefix, n.to_string())),
        Value::Bool(b) => out.push(ContentEntry::new(prefix, b.to_string())),
    }
}

/// Rebuild typed fields from flattened content
pub fn unflatten(document_type: DocumentType, content: &[ContentEntry]) -> Result<ExtractedFields> {
    let entries: BTreeMap<&str, &str> = content
        .iter()
        .map(|entry| (entry.key.as_str(), entry.value.as_str()))
        .collect();
    let value = rebuild(&fields_schema(document_type), "", &entries)?;
    ExtractedFields::from_value(document_type, value)
}

/// Whether any key lives at or below `prefix`
fn has_prefix(entries: &BTreeMap<&str, &str>, prefix: &str) -> bool {
    let nested = format!("{}.", prefix);
    entries
        .keys()
        .any(|key| *key == prefix || key.starts_with(&nested))
}

fn leaf<'a>(
    entries: &BTreeMap<&str, &'a str>,
    path: &str,
) -> std::result::Result<&'a str, ValidationError> {
    entries
        .get(path)
        .copied()
        .ok_or_else(|| ValidationError::missing(path))
}

fn bad_leaf(path: &str, expected: &str) -> ValidationError {
    ValidationError::new(
        path,
        ValidationErrorKind::TypeMismatch {
            expected: expected.to_string(),
            found: "string".to_string(),
        },
    )
}

fn rebuild(
    schema: &Schema,
    path: &str,
    entries: &BTreeMap<&str, &str>,
) -> std::result::Result<Value, ValidationError> {
    match schema {
        Schema::Nullable(inner) => {
            if has_prefix(entries, path) {
                rebuild(inner, path, entries)
            } else {
                Ok(Value::Null)
            }
        }
        Schema::Object(fields) => {
            let mut map = Map::new();
            for field in fields {
                let field_path = join(path, &field.name);
                if !field.required && !has_prefix(entries, &field_path) {
                    continue;
                }
                map.insert(field.name.clone(), rebuild(&field.schema, &field_path, entries)?);
            }
            Ok(Value::Object(map))
        }
        Schema::Array { items, .. } => {
            let mut elements = Vec::new();
            loop {
                let element_path = join(path, &elements.len().to_string());
                if !has_prefix(entries, &element_path) {
                    break;
                }
                elements.push(rebuild(items, &element_path, entries)?);
            }
            Ok(Value::Array(elements))
        }
        Schema::Map(values) => {
            let nested = format!("{}.", path);
            let mut names: Vec<&str> = entries
                .keys()
                .filter_map(|key| key.strip_prefix(nested.as_str()))
                .map(|rest| rest.split('.').next().unwrap_or(rest))
                .collect();
            names.sort_unstable();
            names.dedup();
            let mut map = Map::new();
            for name in names {
                map.insert(name.to_string(), rebuild(values, &join(path, name), entries)?);
            }
            Ok(Value::Object(map))
        }
        Schema::Number { .. } => {
            let raw = leaf(entries, path)?;
            raw.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| bad_leaf(path, "number"))
        }
        Schema::Integer => {
            let raw = leaf(entries, path)?;
            raw.parse::<i64>()
                .map(Value::from)
                .map_err(|_| bad_leaf(path, "integer"))
        }
        Schema::Boolean => match leaf(entries, path)? {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(bad_leaf(path, "boolean")),
        },
        Schema::String { .. } | Schema::Enum(_) | Schema::Any => {
            Ok(Value::String(leaf(entries, path)?.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::extraction::{
        Education, FlightTicketFields, InvoiceFields, LineItem, Money, OtherFields, ReceiptFields,
        ResumeFields, WorkExperience,
    };
    use serde_json::json;

    fn invoice() -> ExtractedFields {
        ExtractedFields::Invoice(InvoiceFields {
            invoice_number: Some("00123".to_string()),
            vendor_name: Some("Acme".to_string()),
            customer_name: Some("Globex".to_string()),
            total_amount: Some(Money {
                value: Some(150.75),
                currency: Some("USD".to_string()),
            }),
            line_items: Some(vec![
                LineItem {
                    description: "Widget".to_string(),
                    quantity: 2.0,
                    unit_price: 50.0,
                    total_price: 100.0,
                },
                LineItem {
                    description: "Shipping".to_string(),
                    quantity: 1.0,
                    unit_price: 50.75,
                    total_price: 50.75,
                },
            ]),
            ..Default::default()
        })
    }

    fn receipt() -> ExtractedFields {
        ExtractedFields::Receipt(ReceiptFields {
            merchant_name: Some("Cafe Luna".to_string()),
            transaction_date: Some("2024-03-02".to_string()),
            transaction_time: Some("08:15".to_string()),
            total_amount: Some(Money {
                value: Some(9.5),
                currency: Some("EUR".to_string()),
            }),
            // Currency only
            tax_amount: Some(Money {
                value: None,
                currency: Some("EUR".to_string()),
            }),
            line_items: Some(vec![LineItem {
                description: "Flat white".to_string(),
                quantity: 2.0,
                unit_price: 4.75,
                total_price: 9.5,
            }]),
            ..Default::default()
        })
    }

    fn flight_ticket() -> ExtractedFields {
        ExtractedFields::FlightTicket(FlightTicketFields {
            passenger_name: Some("Grace Hopper".to_string()),
            ticket_number: Some("0161234567890".to_string()),
            booking_reference: Some("QX7Z2B".to_string()),
            airline: Some("Example Air".to_string()),
            flight_number: Some("1234".to_string()),
            departure_airport: Some("JFK".to_string()),
            departure_date: Some("2024-05-01".to_string()),
            departure_time: Some("09:30".to_string()),
            arrival_airport: Some("SFO".to_string()),
            seat: Some("12A".to_string()),
            ..Default::default()
        })
    }

    fn other() -> ExtractedFields {
        ExtractedFields::Other(OtherFields {
            title: Some("Meeting notes".to_string()),
            description: None,
        })
    }

    fn resume() -> ExtractedFields {
        ExtractedFields::Resume(ResumeFields {
            full_name: Some("Ada Lovelace".to_string()),
            email: Some("ada@example.com".to_string()),
            work_experience: Some(vec![WorkExperience {
                job_title: "Analyst".to_string(),
                company: "Engines Ltd".to_string(),
                start_date: "1842".to_string(),
                end_date: "1843".to_string(),
                description: "Notes on the engine".to_string(),
            }]),
            education: Some(vec![Education {
                degree: "Mathematics".to_string(),
                institution: "Home".to_string(),
                graduation_year: "1835".to_string(),
            }]),
            skills: Some(vec!["math".to_string(), "poetry".to_string()]),
            ..Default::default()
        })
    }

    fn sample(document_type: DocumentType) -> ExtractedFields {
        match document_type {
            DocumentType::Invoice => invoice(),
            DocumentType::Receipt => receipt(),
            DocumentType::Resume => resume(),
            DocumentType::FlightTicket => flight_ticket(),
            DocumentType::Other => other(),
        }
    }

    fn value_of<'a>(entries: &'a [ContentEntry], key: &str) -> Option<&'a str> {
        entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    #[test]
    fn test_flatten_uses_dot_keys_and_string_values() {
        let entries = flatten(&invoice()).unwrap();
        assert_eq!(value_of(&entries, "total_amount.value"), Some("150.75"));
        assert_eq!(value_of(&entries, "total_amount.currency"), Some("USD"));
        assert_eq!(value_of(&entries, "line_items.1.description"), Some("Shipping"));
        assert_eq!(value_of(&entries, "invoice_number"), Some("00123"));
        // Nulls are omitted
        assert_eq!(value_of(&entries, "due_date"), None);
        assert!(entries.iter().all(|e| !e.key.is_empty()));
    }

    #[test]
    fn test_round_trip_invoice() {
        let original = invoice();
        let entries = flatten(&original).unwrap();
        let rebuilt = unflatten(DocumentType::Invoice, &entries).unwrap();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_round_trip_resume_with_nested_arrays() {
        let original = resume();
        let entries = flatten(&original).unwrap();
        assert_eq!(value_of(&entries, "skills.1"), Some("poetry"));
        assert_eq!(value_of(&entries, "education.0.graduation_year"), Some("1835"));
        assert_eq!(unflatten(DocumentType::Resume, &entries).unwrap(), original);
    }

    #[test]
    fn test_round_trip_every_document_type() {
        for document_type in DocumentType::ALL {
            let original = sample(document_type);
            assert_eq!(original.document_type(), document_type);
            let entries = flatten(&original).unwrap();
            assert!(!entries.is_empty(), "{}", document_type);
            assert_eq!(
                unflatten(document_type, &entries).unwrap(),
                original,
                "{}",
                document_type
            );
        }
    }

    #[test]
    fn test_flight_ticket_keeps_numeric_looking_strings() {
        let entries = flatten(&flight_ticket()).unwrap();
        assert_eq!(value_of(&entries, "ticket_number"), Some("0161234567890"));
        match unflatten(DocumentType::FlightTicket, &entries).unwrap() {
            ExtractedFields::FlightTicket(fields) => {
                assert_eq!(fields.flight_number.as_deref(), Some("1234"));
                assert_eq!(fields.arrival_city, None);
            }
            other => panic!("expected flight ticket, got {:?}", other),
        }
    }

    #[test]
    fn test_null_and_empty_values_fold_away() {
        let raw = json!({
            "merchant_name": "Cafe Luna",
            "merchant_address": null,
            "transaction_date": null,
            "transaction_time": null,
            "total_amount": { "value": 9.5, "currency": null },
            "tax_amount": { "value": null, "currency": null },
            "line_items": []
        });
        let fields = ExtractedFields::from_value(DocumentType::Receipt, raw).unwrap();
        match &fields {
            ExtractedFields::Receipt(receipt) => {
                assert_eq!(receipt.tax_amount, None);
                assert_eq!(receipt.line_items, None);
            }
            other => panic!("expected receipt, got {:?}", other),
        }

        let entries = flatten(&fields).unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["merchant_name", "total_amount.value"]);
        assert_eq!(unflatten(DocumentType::Receipt, &entries).unwrap(), fields);

        let other = flatten(&ExtractedFields::Other(OtherFields::default())).unwrap();
        assert!(other.is_empty());
        assert_eq!(
            unflatten(DocumentType::Other, &other).unwrap(),
            ExtractedFields::Other(OtherFields::default())
        );
    }

    #[test]
    fn test_unflatten_rejects_non_numeric_amount() {
        let entries = vec![ContentEntry::new("total_amount.value", "a lot")];
        let err = unflatten(DocumentType::Invoice, &entries).unwrap_err();
        assert!(err.to_string().contains("total_amount.value"));
    }

    #[test]
    fn test_unflatten_missing_required_leaf() {
        let entries = vec![ContentEntry::new("line_items.0.description", "Widget")];
        let err = unflatten(DocumentType::Invoice, &entries).unwrap_err();
        assert!(err.to_string().contains("line_items.0.quantity"));
    }
}
