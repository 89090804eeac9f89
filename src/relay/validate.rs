use bytes::Bytes;
use validator::Validate;

use super::RelayError;
use crate::{
    api_types::{GeneralRequest, RelayMode},
    pricing::SEARCH_CONTEXT_SIZES,
};

const DEFAULT_SEARCH_CONTEXT_SIZE: &str = "medium";

pub fn parse_request(body: &Bytes) -> Result<GeneralRequest, RelayError> {
    serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidRequest(format!("invalid request body: {e}")))
}

/// Check a parsed request before anything is priced or held.
///
/// Fills in the default web search context size when web search options are
/// present without one.
pub fn validate_request(
    mode: RelayMode,
    request: &mut GeneralRequest,
    max_tokens_ceiling: u64,
) -> Result<(), RelayError> {
    if request.model.trim().is_empty() {
        return Err(RelayError::InvalidRequest("model is required".into()));
    }
    request
        .validate()
        .map_err(|e| RelayError::InvalidRequest(e.to_string()))?;

    let missing = match mode {
        RelayMode::ChatCompletions => {
            request.messages.as_ref().is_none_or(Vec::is_empty).then_some("messages")
        }
        RelayMode::Completions => request.prompt.is_none().then_some("prompt"),
        RelayMode::Embeddings | RelayMode::Moderations => {
            request.input.is_none().then_some("input")
        }
        RelayMode::Edits => request
            .instruction
            .as_deref()
            .is_none_or(str::is_empty)
            .then_some("instruction"),
        _ => None,
    };
    if let Some(field) = missing {
        return Err(RelayError::InvalidRequest(format!("field {field} is required")));
    }

    if request.max_output().is_some_and(|n| n > max_tokens_ceiling) {
        return Err(RelayError::InvalidRequest("max_tokens is invalid".into()));
    }

    if let Some(options) = request.web_search_options.as_mut() {
        match options.search_context_size.as_deref() {
            None => options.search_context_size = Some(DEFAULT_SEARCH_CONTEXT_SIZE.into()),
            Some(size) if SEARCH_CONTEXT_SIZES.contains(&size) => {}
            Some(size) => {
                return Err(RelayError::InvalidRequest(format!(
                    "invalid search_context_size {size:?}, expected low, medium or high"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    const CEILING: u64 = (i32::MAX / 2) as u64;

    fn request(body: serde_json::Value) -> GeneralRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = parse_request(&Bytes::from_static(b"{not json")).unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }

    #[rstest]
    #[case(RelayMode::ChatCompletions, json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}), true)]
    #[case(RelayMode::ChatCompletions, json!({"model": "m"}), false)]
    #[case(RelayMode::ChatCompletions, json!({"model": "m", "messages": []}), false)]
    #[case(RelayMode::ChatCompletions, json!({"model": "", "messages": [{"role": "user", "content": "hi"}]}), false)]
    #[case(RelayMode::Completions, json!({"model": "m", "prompt": "once"}), true)]
    #[case(RelayMode::Completions, json!({"model": "m"}), false)]
    #[case(RelayMode::Embeddings, json!({"model": "m", "input": ["a", "b"]}), true)]
    #[case(RelayMode::Moderations, json!({"model": "m"}), false)]
    #[case(RelayMode::Edits, json!({"model": "m", "input": "x", "instruction": "fix"}), true)]
    #[case(RelayMode::Edits, json!({"model": "m", "input": "x"}), false)]
    #[case(RelayMode::Responses, json!({"model": "m", "input": "x"}), true)]
    fn test_required_fields(
        #[case] mode: RelayMode,
        #[case] body: serde_json::Value,
        #[case] ok: bool,
    ) {
        let mut req = request(body);
        assert_eq!(validate_request(mode, &mut req, CEILING).is_ok(), ok);
    }

    #[test]
    fn test_max_tokens_ceiling() {
        let mut req = request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": CEILING + 1,
        }));
        let err = validate_request(RelayMode::ChatCompletions, &mut req, CEILING).unwrap_err();
        assert_eq!(err.to_string(), "max_tokens is invalid");

        req.max_tokens = Some(CEILING);
        assert!(validate_request(RelayMode::ChatCompletions, &mut req, CEILING).is_ok());
    }

    #[test]
    fn test_search_context_size_defaults_to_medium() {
        let mut req = request(json!({
            "model": "gpt-4o-search-preview",
            "messages": [{"role": "user", "content": "news?"}],
            "web_search_options": {},
        }));
        validate_request(RelayMode::ChatCompletions, &mut req, CEILING).unwrap();
        assert_eq!(
            req.web_search_options.unwrap().search_context_size.as_deref(),
            Some("medium")
        );
    }

    #[test]
    fn test_search_context_size_rejects_unknown() {
        let mut req = request(json!({
            "model": "gpt-4o-search-preview",
            "messages": [{"role": "user", "content": "news?"}],
            "web_search_options": {"search_context_size": "huge"},
        }));
        assert!(validate_request(RelayMode::ChatCompletions, &mut req, CEILING).is_err());
    }

    #[test]
    fn test_every_priced_search_context_size_accepted() {
        for size in SEARCH_CONTEXT_SIZES {
            let mut req = request(json!({
                "model": "gpt-4o-search-preview",
                "messages": [{"role": "user", "content": "news?"}],
                "web_search_options": {"search_context_size": size},
            }));
            validate_request(RelayMode::ChatCompletions, &mut req, CEILING).unwrap();
            assert_eq!(
                req.web_search_options.unwrap().search_context_size.as_deref(),
                Some(size)
            );
        }
    }
}
