//! Search queries and Bundle pages.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::FetchResult;
use crate::error::FetchError;

/// Resource types this client retrieves for a patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Patient,
    Condition,
    MedicationRequest,
    Observation,
}

impl ResourceType {
    /// All supported types, in fetch order.
    pub const ALL: [ResourceType; 4] = [
        Self::Patient,
        Self::Condition,
        Self::MedicationRequest,
        Self::Observation,
    ];

    /// FHIR type name as used in URLs and `resourceType`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "Patient",
            Self::Condition => "Condition",
            Self::MedicationRequest => "MedicationRequest",
            Self::Observation => "Observation",
        }
    }

    /// Search parameter that scopes a search to one patient.
    #[must_use]
    pub fn patient_param(&self) -> &'static str {
        match self {
            Self::Patient => "_id",
            _ => "patient",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| FetchError::configuration(format!("unsupported resource type '{s}'")))
    }
}

/// A search for one resource type belonging to one patient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FhirQuery {
    resource_type: ResourceType,
    patient_id: String,
    category: Option<String>,
    date: Option<String>,
    page_cursor: Option<String>,
}

impl FhirQuery {
    /// Creates an unfiltered search.
    #[must_use]
    pub fn new(resource_type: ResourceType, patient_id: impl Into<String>) -> Self {
        Self {
            resource_type,
            patient_id: patient_id.into(),
            category: None,
            date: None,
            page_cursor: None,
        }
    }

    /// Restricts the search to a category (e.g. `laboratory`).
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Adds a `date` filter, using FHIR prefixes (e.g. `ge2024-01-01`).
    #[must_use]
    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    /// Starts from a `next` link obtained earlier instead of the first page.
    #[must_use]
    pub fn with_page_cursor(mut self, url: impl Into<String>) -> Self {
        self.page_cursor = Some(url.into());
        self
    }

    #[must_use]
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    #[must_use]
    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    #[must_use]
    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    #[must_use]
    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    #[must_use]
    pub fn page_cursor(&self) -> Option<&str> {
        self.page_cursor.as_deref()
    }

    /// Query parameters for the first page.
    #[must_use]
    pub fn search_params(&self, page_size: u32) -> Vec<(String, String)> {
        let mut params = vec![(
            self.resource_type.patient_param().to_string(),
            self.patient_id.clone(),
        )];
        if let Some(category) = &self.category {
            params.push(("category".to_string(), category.clone()));
        }
        if let Some(date) = &self.date {
            params.push(("date".to_string(), date.clone()));
        }
        params.push(("_count".to_string(), page_size.to_string()));
        params
    }
}

/// One page of a searchset Bundle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FhirPage {
    /// Resources in server order.
    pub entries: Vec<Value>,
    /// URL of the next page, if any.
    pub next: Option<String>,
    /// Server-reported total, if any.
    pub total: Option<u64>,
}

impl FhirPage {
    /// Parses a response body into a page.
    ///
    /// # Errors
    /// Returns [`FetchError::InvalidResponse`] if the body is not JSON or is
    /// not a Bundle.
    pub fn parse(body: &str) -> FetchResult<Self> {
        let bundle: Value = serde_json::from_str(body)
            .map_err(|e| FetchError::invalid_response(format!("body is not JSON: {e}")))?;
        Self::from_bundle(bundle)
    }

    /// Extracts the entries and `next` link from a Bundle.
    ///
    /// Entries without a `resource` and OperationOutcome entries reported
    /// with `search.mode = outcome` are skipped.
    ///
    /// # Errors
    /// Returns [`FetchError::InvalidResponse`] if the value is not a Bundle.
    pub fn from_bundle(mut bundle: Value) -> FetchResult<Self> {
        match bundle.get("resourceType").and_then(Value::as_str) {
            Some("Bundle") => {}
            Some(other) => {
                return Err(FetchError::invalid_response(format!(
                    "expected Bundle, got {other}"
                )));
            }
            None => return Err(FetchError::invalid_response("missing resourceType")),
        }

        let next = bundle
            .get("link")
            .and_then(Value::as_array)
            .and_then(|links| {
                links
                    .iter()
                    .find(|l| l.get("relation").and_then(Value::as_str) == Some("next"))
            })
            .and_then(|l| l.get("url"))
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        let total = bundle.get("total").and_then(Value::as_u64);

        let raw_entries = match bundle.get_mut("entry").map(Value::take) {
            Some(Value::Array(entries)) => entries,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(FetchError::invalid_response("Bundle.entry is not an array")),
        };

        let mut entries = Vec::with_capacity(raw_entries.len());
        for (index, mut entry) in raw_entries.into_iter().enumerate() {
            let is_outcome = entry
                .get("search")
                .and_then(|s| s.get("mode"))
                .and_then(Value::as_str)
                == Some("outcome");
            if is_outcome {
                tracing::debug!(index, "Skipping search outcome entry");
                continue;
            }
            match entry.get_mut("resource").map(Value::take) {
                Some(resource @ Value::Object(_)) => entries.push(resource),
                _ => tracing::warn!(index, "Skipping Bundle entry without a resource"),
            }
        }

        Ok(Self {
            entries,
            next,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_search_params() {
        let query = FhirQuery::new(ResourceType::Observation, "P1").with_category("laboratory");
        assert_eq!(
            query.search_params(50),
            vec![
                ("patient".to_string(), "P1".to_string()),
                ("category".to_string(), "laboratory".to_string()),
                ("_count".to_string(), "50".to_string()),
            ]
        );
    }

    #[test]
    fn test_patient_search_uses_id() {
        let params = FhirQuery::new(ResourceType::Patient, "P1").search_params(10);
        assert_eq!(params[0], ("_id".to_string(), "P1".to_string()));
    }

    #[test]
    fn test_resource_type_parse() {
        assert_eq!(
            "observation".parse::<ResourceType>().unwrap(),
            ResourceType::Observation
        );
        assert!("Encounter".parse::<ResourceType>().is_err());
    }

    #[test]
    fn test_page_extracts_entries_and_next() {
        let page = FhirPage::from_bundle(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "total": 3,
            "link": [
                {"relation": "self", "url": "https://x/Observation?patient=P1"},
                {"relation": "next", "url": "https://x/Observation?page=2"}
            ],
            "entry": [
                {"resource": {"resourceType": "Observation", "id": "o1"}},
                {"fullUrl": "https://x/Observation/o2"},
                {"resource": {"resourceType": "OperationOutcome"}, "search": {"mode": "outcome"}},
                {"resource": {"resourceType": "Observation", "id": "o3"}}
            ]
        }))
        .unwrap();

        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0]["id"], "o1");
        assert_eq!(page.entries[1]["id"], "o3");
        assert_eq!(page.next.as_deref(), Some("https://x/Observation?page=2"));
        assert_eq!(page.total, Some(3));
    }

    #[test]
    fn test_empty_bundle() {
        let page = FhirPage::parse(r#"{"resourceType":"Bundle","total":0}"#).unwrap();
        assert!(page.entries.is_empty());
        assert!(page.next.is_none());
    }

    #[test]
    fn test_non_bundle_is_error() {
        for body in [
            "<html></html>",
            r#"{"resourceType":"OperationOutcome"}"#,
            r#"{"entry":[]}"#,
            r#"{"resourceType":"Bundle","entry":{}}"#,
        ] {
            assert!(
                matches!(FhirPage::parse(body), Err(FetchError::InvalidResponse { .. })),
                "{body}"
            );
        }
    }
}
