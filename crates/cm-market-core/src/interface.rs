//! Contract interface descriptions: human-readable signatures or a JSON ABI.

use alloy_json_abi::{Event, Function, JsonAbi};
use serde_json::Value;

use crate::error::{MarketError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceSource {
    /// One signature per entry, e.g. `function ownerOf(uint256 tokenId) view returns (address)`.
    HumanReadable(Vec<String>),
    /// A JSON ABI array, or a compiler artifact carrying one under `abi`.
    Json(String),
}

impl InterfaceSource {
    pub fn human_readable(lines: &[&str]) -> Self {
        Self::HumanReadable(lines.iter().map(|line| (*line).to_owned()).collect())
    }

    pub fn parse(&self) -> Result<JsonAbi> {
        let abi = match self {
            InterfaceSource::HumanReadable(lines) => parse_signatures(lines)?,
            InterfaceSource::Json(text) => parse_json(text)?,
        };

        if abi.functions.is_empty() && abi.events.is_empty() {
            return Err(MarketError::InvalidInterface(
                "interface declares no functions or events".to_owned(),
            ));
        }
        Ok(abi)
    }
}

fn parse_signatures(lines: &[String]) -> Result<JsonAbi> {
    let mut abi = JsonAbi::default();
    for line in lines.iter().map(|line| line.trim()).filter(|line| !line.is_empty()) {
        if line.starts_with("event ") {
            let event = Event::parse(line)
                .map_err(|err| MarketError::InvalidInterface(format!("`{line}`: {err}")))?;
            abi.events.entry(event.name.clone()).or_default().push(event);
        } else {
            let function = Function::parse(line)
                .map_err(|err| MarketError::InvalidInterface(format!("`{line}`: {err}")))?;
            abi.functions
                .entry(function.name.clone())
                .or_default()
                .push(function);
        }
    }
    Ok(abi)
}

fn parse_json(text: &str) -> Result<JsonAbi> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| MarketError::InvalidInterface(format!("malformed JSON: {err}")))?;

    let items = match value {
        Value::Object(mut artifact) => artifact
            .remove("abi")
            .ok_or_else(|| MarketError::InvalidInterface("artifact has no `abi` field".to_owned()))?,
        other => other,
    };

    serde_json::from_value(items).map_err(|err| MarketError::InvalidInterface(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_api_types::interfaces::{CARD_REGISTRY_INTERFACE, MARKETPLACE_INTERFACE};

    #[test]
    fn canonical_interfaces_parse() {
        let registry = InterfaceSource::human_readable(CARD_REGISTRY_INTERFACE)
            .parse()
            .unwrap();
        assert!(registry.function("getCardInfo").is_some());
        assert!(registry.event("Transfer").is_some());

        let marketplace = InterfaceSource::human_readable(MARKETPLACE_INTERFACE)
            .parse()
            .unwrap();
        assert_eq!(marketplace.event("Listed").map(Vec::len), Some(1));
    }

    #[test]
    fn json_artifact_and_bare_array_are_accepted() {
        let array = r#"[{"type":"function","name":"ownerOf","inputs":[{"name":"tokenId","type":"uint256"}],"outputs":[{"name":"","type":"address"}],"stateMutability":"view"}]"#;
        let bare = InterfaceSource::Json(array.to_owned()).parse().unwrap();
        assert!(bare.function("ownerOf").is_some());

        let artifact = format!(r#"{{"contractName":"CardRegistry","abi":{array}}}"#);
        let wrapped = InterfaceSource::Json(artifact).parse().unwrap();
        assert_eq!(wrapped.functions.len(), 1);
    }

    #[test]
    fn malformed_descriptions_are_rejected() {
        let garbage = InterfaceSource::human_readable(&["function (uint256"]);
        assert!(matches!(garbage.parse(), Err(MarketError::InvalidInterface(_))));

        let empty = InterfaceSource::HumanReadable(Vec::new());
        assert!(matches!(empty.parse(), Err(MarketError::InvalidInterface(_))));

        let not_json = InterfaceSource::Json("{ abi: nope".to_owned());
        assert!(matches!(not_json.parse(), Err(MarketError::InvalidInterface(_))));
    }
}
