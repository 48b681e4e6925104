// Extraction Result domain model
// Typed, validated output of the extraction stage

//! # Extraction Results
//!
//! The text-understanding service answers with loosely typed JSON. This module
//! is the boundary that turns that JSON into one of a closed set of typed
//! variants ([`ExtractedFields`]) or an explicit validation error.
//!
//! ## Review Policy
//!
//! A result requires human review when the classification confidence or any
//! per-field confidence is strictly below [`REVIEW_THRESHOLD`]. The flag is
//! never stored; [`ExtractionResult::requires_review`] derives it from the
//! confidences every time, so it cannot drift from the underlying data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::document::DocumentType;
use crate::schema::{self, Field, Schema, ValidationError};
use crate::{PipelineError, Result};

/// Confidence below which a result is routed to human review
pub const REVIEW_THRESHOLD: f64 = 0.8;

/// Monetary amount as extracted from a document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Money {
    pub value: Option<f64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_price: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceFields {
    pub invoice_number: Option<String>,
    pub issue_date: Option<String>,
    pub due_date: Option<String>,
    pub vendor_name: Option<String>,
    pub vendor_address: Option<String>,
    pub customer_name: Option<String>,
    pub customer_address: Option<String>,
    pub total_amount: Option<Money>,
    pub tax_amount: Option<Money>,
    pub line_items: Option<Vec<LineItem>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptFields {
    pub merchant_name: Option<String>,
    pub merchant_address: Option<String>,
    pub transaction_date: Option<String>,
    pub transaction_time: Option<String>,
    pub total_amount: Option<Money>,
    pub tax_amount: Option<Money>,
    pub line_items: Option<Vec<LineItem>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkExperience {
    pub job_title: String,
    pub company: String,
    pub start_date: String,
    pub end_date: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Education {
    pub degree: String,
    pub institution: String,
    pub graduation_year: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeFields {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linkedin_url: Option<String>,
    pub summary: Option<String>,
    pub work_experience: Option<Vec<WorkExperience>>,
    pub education: Option<Vec<Education>>,
    pub skills: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlightTicketFields {
    pub passenger_name: Option<String>,
    pub ticket_number: Option<String>,
    pub booking_reference: Option<String>,
    pub airline: Option<String>,
    pub flight_number: Option<String>,
    pub departure_airport: Option<String>,
    pub departure_city: Option<String>,
    pub departure_date: Option<String>,
    pub departure_time: Option<String>,
    pub arrival_airport: Option<String>,
    pub arrival_city: Option<String>,
    pub arrival_date: Option<String>,
    pub arrival_time: Option<String>,
    pub seat: Option<String>,
}

/// Fallback for documents outside the known types
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtherFields {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Structured content, one variant per document type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "document_type", content = "fields", rename_all = "snake_case")]
pub enum ExtractedFields {
    Invoice(InvoiceFields),
    Receipt(ReceiptFields),
    Resume(ResumeFields),
    FlightTicket(FlightTicketFields),
    Other(OtherFields),
}

fn nullable_string() -> Schema {
    Schema::string().nullable()
}

fn money_schema() -> Schema {
    Schema::object(vec![
        Field::required("value", Schema::number().nullable()),
        Field::required("currency", nullable_string()),
    ])
    .nullable()
}

fn line_items_schema() -> Schema {
    Schema::array(Schema::object(vec![
        Field::required("description", Schema::string()),
        Field::required("quantity", Schema::number()),
        Field::required("unit_price", Schema::number()),
        Field::required("total_price", Schema::number()),
    ]))
    .nullable()
}

fn string_fields(names: &[&str]) -> Vec<Field> {
    names
        .iter()
        .map(|name| Field::required(*name, nullable_string()))
        .collect()
}

/// Schema of the `extracted_content` object for a document type
pub fn fields_schema(document_type: DocumentType) -> Schema {
    let fields = match document_type {
        DocumentType::Invoice => {
            let mut fields = string_fields(&[
                "invoice_number",
                "issue_date",
                "due_date",
                "vendor_name",
                "vendor_address",
                "customer_name",
                "customer_address",
            ]);
            fields.push(Field::required("total_amount", money_schema()));
            fields.push(Field::required("tax_amount", money_schema()));
            fields.push(Field::required("line_items", line_items_schema()));
            fields
        }
        DocumentType::Receipt => {
            let mut fields = string_fields(&[
                "merchant_name",
                "merchant_address",
                "transaction_date",
                "transaction_time",
            ]);
            fields.push(Field::required("total_amount", money_schema()));
            fields.push(Field::required("tax_amount", money_schema()));
            fields.push(Field::required("line_items", line_items_schema()));
            fields
        }
        DocumentType::Resume => {
            let mut fields =
                string_fields(&["full_name", "email", "phone_number", "linkedin_url", "summary"]);
            fields.push(Field::required(
                "work_experience",
                Schema::array(Schema::object(vec![
                    Field::required("job_title", Schema::string()),
                    Field::required("company", Schema::string()),
                    Field::required("start_date", Schema::string()),
                    Field::required("end_date", Schema::string()),
                    Field::required("description", Schema::string()),
                ]))
                .nullable(),
            ));
            fields.push(Field::required(
                "education",
                Schema::array(Schema::object(vec![
                    Field::required("degree", Schema::string()),
                    Field::required("institution", Schema::string()),
                    Field::required("graduation_year", Schema::string()),
                ]))
                .nullable(),
            ));
            fields.push(Field::required(
                "skills",
                Schema::array(Schema::string()).nullable(),
            ));
            fields
        }
        DocumentType::FlightTicket => string_fields(&[
            "passenger_name",
            "ticket_number",
            "booking_reference",
            "airline",
            "flight_number",
            "departure_airport",
            "departure_city",
            "departure_date",
            "departure_time",
            "arrival_airport",
            "arrival_city",
            "arrival_date",
            "arrival_time",
            "seat",
        ]),
        DocumentType::Other => string_fields(&["title", "description"]),
    };
    Schema::object(fields)
}

/// Fold empty optional structure to null, guided by the schema.
///
/// A nullable object whose members are all null and a nullable empty array
/// carry no information; folding them keeps flattening exactly invertible.
fn normalize(schema: &Schema, value: Value) -> Value {
    match (schema, value) {
        (Schema::Nullable(inner), value) => {
            let value = normalize(inner, value);
            let empty = match &value {
                Value::Object(map) => map.values().all(Value::is_null),
                Value::Array(items) => items.is_empty(),
                _ => false,
            };
            if empty {
                Value::Null
            } else {
                value
            }
        }
        (Schema::Object(fields), Value::Object(mut map)) => {
            for field in fields {
                if let Some(member) = map.remove(&field.name) {
                    map.insert(field.name.clone(), normalize(&field.schema, member));
                }
            }
            Value::Object(map)
        }
        (Schema::Array { items, .. }, Value::Array(elements)) => Value::Array(
            elements
                .into_iter()
                .map(|element| normalize(items, element))
                .collect(),
        ),
        (_, value) => value,
    }
}

impl ExtractedFields {
    pub fn document_type(&self) -> DocumentType {
        match self {
            ExtractedFields::Invoice(_) => DocumentType::Invoice,
            ExtractedFields::Receipt(_) => DocumentType::Receipt,
            ExtractedFields::Resume(_) => DocumentType::Resume,
            ExtractedFields::FlightTicket(_) => DocumentType::FlightTicket,
            ExtractedFields::Other(_) => DocumentType::Other,
        }
    }

    /// Validate raw `extracted_content` JSON for `document_type` and type it
    pub fn from_value(document_type: DocumentType, value: Value) -> Result<Self> {
        let schema = fields_schema(document_type);
        schema::validate(&schema, &value)?;
        let value = normalize(&schema, value);
        let fields = match document_type {
            DocumentType::Invoice => ExtractedFields::Invoice(serde_json::from_value(value)?),
            DocumentType::Receipt => ExtractedFields::Receipt(serde_json::from_value(value)?),
            DocumentType::Resume => ExtractedFields::Resume(serde_json::from_value(value)?),
            DocumentType::FlightTicket => {
                ExtractedFields::FlightTicket(serde_json::from_value(value)?)
            }
            DocumentType::Other => ExtractedFields::Other(serde_json::from_value(value)?),
        };
        Ok(fields)
    }

    /// The variant's fields as a JSON object
    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            ExtractedFields::Invoice(fields) => serde_json::to_value(fields)?,
            ExtractedFields::Receipt(fields) => serde_json::to_value(fields)?,
            ExtractedFields::Resume(fields) => serde_json::to_value(fields)?,
            ExtractedFields::FlightTicket(fields) => serde_json::to_value(fields)?,
            ExtractedFields::Other(fields) => serde_json::to_value(fields)?,
        };
        Ok(value)
    }
}

/// `true` iff any confidence is strictly below [`REVIEW_THRESHOLD`]
pub fn requires_review(classification_confidence: f64, field_confidence: &BTreeMap<String, f64>) -> bool {
    classification_confidence < REVIEW_THRESHOLD
        || field_confidence.values().any(|c| *c < REVIEW_THRESHOLD)
}

/// Validated structured output of the extraction stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub fields: ExtractedFields,
    pub classification_confidence: f64,
    pub field_confidence: BTreeMap<String, f64>,
    pub summary: String,
    pub keywords: Vec<String>,
}

impl ExtractionResult {
    pub fn document_type(&self) -> DocumentType {
        self.fields.document_type()
    }

    pub fn requires_review(&self) -> bool {
        requires_review(self.classification_confidence, &self.field_confidence)
    }

    /// Field names whose confidence is below the review threshold
    pub fn low_confidence_fields(&self) -> Vec<&str> {
        self.field_confidence
            .iter()
            .filter(|(_, confidence)| **confidence < REVIEW_THRESHOLD)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Human-readable reasons for review, `None` when none apply
    pub fn review_notes(&self) -> Option<String> {
        let mut reasons = Vec::new();
        if self.classification_confidence < REVIEW_THRESHOLD {
            reasons.push(format!(
                "Low classification confidence ({:.2})",
                self.classification_confidence
            ));
        }
        let low = self.low_confidence_fields();
        if !low.is_empty() {
            reasons.push(format!("Low confidence for fields: {}", low.join(", ")));
        }
        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("; "))
        }
    }

    /// Envelope the text-understanding service must answer with.
    ///
    /// `extracted_content` is checked separately against the schema of the
    /// claimed document type.
    pub fn response_schema(extracted_content: Schema) -> Schema {
        Schema::object(vec![
            Field::required("document_type", Schema::enumeration(&DocumentType::names())),
            Field::required("classification_confidence", Schema::number_in(0.0, 1.0)),
            Field::required("extracted_content", extracted_content),
            Field::required("field_confidence", Schema::map(Schema::number_in(0.0, 1.0))),
            Field::required("summary", Schema::non_empty_string()),
            Field::required("keywords", Schema::nonempty_array(Schema::string())),
        ])
    }

    /// Parse and validate the raw text returned by the text-understanding service
    pub fn from_response(text: &str) -> Result<Self> {
        let value = schema::parse_json(text)?;

        // Envelope first, so the document type can pick the content schema
        schema::validate(&Self::response_schema(Schema::object(vec![])), &value)?;
        let mut envelope: Map<String, Value> = match value {
            Value::Object(map) => map,
            _ => return Err(ValidationError::malformed("expected a JSON object").into()),
        };

        let type_name = envelope
            .get("document_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let document_type = DocumentType::parse(&type_name)
            .ok_or_else(|| PipelineError::Stage(format!("unknown document type {}", type_name)))?;

        // Re-validate the whole envelope so errors carry full paths
        let full = Value::Object(envelope.clone());
        schema::validate(&Self::response_schema(fields_schema(document_type)), &full)?;

        let content = envelope.remove("extracted_content").unwrap_or(Value::Null);
        let fields = ExtractedFields::from_value(document_type, content)?;

        let classification_confidence = envelope
            .get("classification_confidence")
            .and_then(Value::as_f64)
            .unwrap_or_default();
        let field_confidence: BTreeMap<String, f64> = serde_json::from_value(
            envelope.remove("field_confidence").unwrap_or(Value::Null),
        )?;
        let summary: String =
            serde_json::from_value(envelope.remove("summary").unwrap_or(Value::Null))?;
        let keywords: Vec<String> =
            serde_json::from_value(envelope.remove("keywords").unwrap_or(Value::Null))?;

        Ok(Self {
            fields,
            classification_confidence,
            field_confidence,
            summary,
            keywords,
        })
    }
}
