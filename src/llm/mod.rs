// Text understanding - the external reasoning call behind the extraction stage

//! # Text Understanding
//!
//! The pipeline treats semantic extraction as a black box: raw document text
//! goes in, JSON text comes out. Nothing returned from here is trusted; the
//! extraction stage runs every reply through the Schema Validator.
//!
//! - [`TextUnderstanding`]: the seam the extraction stage depends on
//! - [`openai::OpenAICompatibleClient`]: chat-completions client for any
//!   OpenAI-compatible endpoint (OpenRouter by default)

pub mod openai;

use async_trait::async_trait;

use crate::models::extraction::{fields_schema, ExtractionResult};
use crate::models::DocumentType;
use crate::schema::Schema;
use crate::Result;

pub use openai::OpenAICompatibleClient;

/// External service that classifies a document and extracts its fields
#[async_trait]
pub trait TextUnderstanding: Send + Sync {
    /// Return the service's raw reply for `raw_text`.
    ///
    /// ## Errors
    /// `TextUnderstanding` when the service cannot be reached or refuses the
    /// request. A reply that is not valid JSON is *not* an error here.
    async fn understand(&self, raw_text: &str) -> Result<String>;
}

/// Instructions sent with every extraction request
pub fn system_prompt() -> String {
    let mut prompt = String::from(
        "You are a document parsing and extraction agent. Read the document text \
         and return a single JSON object, with no Markdown and no explanations.\n\n\
         1. Classify the document as exactly one of the document types below.\n\
         2. Extract every field of that type's schema. A value that is not present \
         in the document must be null.\n\
         3. Dates use YYYY-MM-DD. Money is {\"value\": number, \"currency\": string}.\n\
         4. Report a confidence between 0 and 1 for the classification and for \
         every extracted field.\n\n\
         SCHEMAS:\n",
    );

    for document_type in DocumentType::ALL {
        prompt.push_str(&format!(
            "{}: {}\n",
            document_type,
            fields_schema(document_type).describe()
        ));
    }

    prompt.push_str("\nOUTPUT FORMAT:\n");
    prompt.push_str(&ExtractionResult::response_schema(Schema::any()).describe());
    prompt.push_str(
        "\nextracted_content follows the schema of document_type; \
         field_confidence maps field names to confidences; \
         summary is one or two sentences; keywords lists the main topics.",
    );
    prompt
}

/// Remove a surrounding Markdown code fence, if the service added one
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`) on the opening line
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  ```\n{}\n```  "), "{}");
    }

    #[test]
    fn test_system_prompt_lists_every_type() {
        let prompt = system_prompt();
        for document_type in DocumentType::ALL {
            assert!(prompt.contains(&format!("{}: {{", document_type)));
        }
        assert!(prompt.contains("\"classification_confidence\": number"));
        assert!(prompt.contains("\"invoice_number\": string | null"));
    }
}
