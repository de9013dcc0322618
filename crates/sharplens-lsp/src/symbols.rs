use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::protocol::{
    LspDocumentSymbol, LspLocation, LspLocationLink, LspRange, LspSymbolInformation, symbol_kind,
    symbol_kind_name,
};

/// One node of the flattened symbol tree, depth-first, parent before
/// children, source order preserved.
#[derive(Debug, Clone)]
pub struct FlatSymbol {
    pub name: String,
    pub kind: u32,
    pub detail: Option<String>,
    pub range: LspRange,
}

/// Caller-facing symbol descriptor. Full mode carries `detail` and `range`;
/// signature-only mode renames `detail` to `signature` and drops the range.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolDescriptor {
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<LspRange>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SymbolReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    pub symbols: Vec<SymbolDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolQueryOptions {
    /// Keep only symbols of this kind; see [`filter_kind_set`] for names.
    pub kind_filter: Option<String>,
    pub signature_only: bool,
}

pub(crate) fn parse_symbols(value: Value) -> Result<Vec<FlatSymbol>> {
    if value.is_null() {
        return Ok(Vec::new());
    }

    // textDocument/documentSymbol returns DocumentSymbol[] or SymbolInformation[].
    let Some(arr) = value.as_array() else {
        return Err(anyhow!("documentSymbol response is not an array"));
    };
    if arr.is_empty() {
        return Ok(Vec::new());
    }

    // Detect the hierarchical shape by presence of "selectionRange".
    if arr[0].get("selectionRange").is_some() {
        let roots: Vec<LspDocumentSymbol> = serde_json::from_value(Value::Array(arr.clone()))
            .context("failed to parse DocumentSymbol[]")?;
        let mut out = Vec::new();
        for root in &roots {
            flatten_document_symbol(root, &mut out);
        }
        return Ok(out);
    }

    let infos: Vec<LspSymbolInformation> = serde_json::from_value(Value::Array(arr.clone()))
        .context("failed to parse SymbolInformation[]")?;
    Ok(infos
        .into_iter()
        .map(|info| FlatSymbol {
            name: info.name,
            kind: info.kind,
            detail: None,
            range: info.location.range,
        })
        .collect())
}

fn flatten_document_symbol(sym: &LspDocumentSymbol, out: &mut Vec<FlatSymbol>) {
    out.push(FlatSymbol {
        name: sym.name.clone(),
        kind: sym.kind,
        detail: sym.detail.clone(),
        range: sym.range.clone(),
    });
    for child in &sym.children {
        flatten_document_symbol(child, out);
    }
}

/// Kind set a filter name expands to. "Method" deliberately includes
/// constructors; the other filters are one-to-one.
pub fn filter_kind_set(filter: &str) -> Option<&'static [u32]> {
    match filter.trim().to_ascii_lowercase().as_str() {
        "property" => Some(&[symbol_kind::PROPERTY]),
        "field" => Some(&[symbol_kind::FIELD]),
        "event" => Some(&[symbol_kind::EVENT]),
        "method" => Some(&[symbol_kind::METHOD, symbol_kind::CONSTRUCTOR]),
        "class" => Some(&[symbol_kind::CLASS]),
        "interface" => Some(&[symbol_kind::INTERFACE]),
        "enum" => Some(&[symbol_kind::ENUM]),
        _ => None,
    }
}

pub fn filter_symbols_by_kind(symbols: Vec<FlatSymbol>, filter: &str) -> Vec<FlatSymbol> {
    let Some(kinds) = filter_kind_set(filter) else {
        warn!("unknown symbol kind filter: {filter}");
        return Vec::new();
    };
    symbols
        .into_iter()
        .filter(|sym| kinds.contains(&sym.kind))
        .collect()
}

pub fn format_symbols(symbols: Vec<FlatSymbol>, signature_only: bool) -> Vec<SymbolDescriptor> {
    symbols
        .into_iter()
        .map(|sym| {
            let kind = symbol_kind_name(sym.kind).to_string();
            if signature_only {
                SymbolDescriptor {
                    name: sym.name,
                    kind,
                    detail: None,
                    signature: sym.detail,
                    range: None,
                }
            } else {
                SymbolDescriptor {
                    name: sym.name,
                    kind,
                    detail: sym.detail,
                    signature: None,
                    range: Some(sym.range),
                }
            }
        })
        .collect()
}

/// Normalizes a definition/typeDefinition result (null, Location,
/// Location[] or LocationLink[]) into a flat location list. Unrecognized
/// entries are skipped, not fatal.
pub(crate) fn parse_location_results(value: Value) -> Result<Vec<LspLocation>> {
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        _ => return Err(anyhow!("location response is neither array nor object")),
    };

    let mut out = Vec::new();
    for item in items {
        match to_lsp_location(&item) {
            Ok(location) => out.push(location),
            Err(err) => warn!("skipping unrecognized location: {err:#}"),
        }
    }
    Ok(out)
}

fn to_lsp_location(value: &Value) -> Result<LspLocation> {
    if value.get("uri").is_some() {
        let location: LspLocation =
            serde_json::from_value(value.clone()).context("failed to parse Location")?;
        return Ok(location);
    }

    if value.get("targetUri").is_some() {
        let link: LspLocationLink =
            serde_json::from_value(value.clone()).context("failed to parse LocationLink")?;
        return Ok(LspLocation {
            uri: link.target_uri,
            range: link.target_selection_range,
        });
    }

    Err(anyhow!("unknown location shape"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LspPosition;
    use serde_json::json;

    fn range(line: u32) -> LspRange {
        LspRange {
            start: LspPosition { line, character: 0 },
            end: LspPosition { line, character: 10 },
        }
    }

    fn sym(name: &str, kind: u32) -> FlatSymbol {
        FlatSymbol {
            name: name.to_string(),
            kind,
            detail: Some(format!("detail of {name}")),
            range: range(0),
        }
    }

    #[test]
    fn method_filter_keeps_methods_and_constructors_in_order() {
        let mixed = vec![
            sym("Count", symbol_kind::PROPERTY),
            sym("Render", symbol_kind::METHOD),
            sym("_buffer", symbol_kind::FIELD),
            sym("Changed", symbol_kind::EVENT),
            sym(".ctor", symbol_kind::CONSTRUCTOR),
            sym("Widget", symbol_kind::CLASS),
        ];

        let filtered = filter_symbols_by_kind(mixed, "Method");
        let names: Vec<&str> = filtered.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Render", ".ctor"]);
    }

    #[test]
    fn unknown_filter_yields_nothing() {
        let symbols = vec![sym("Render", symbol_kind::METHOD)];
        assert!(filter_symbols_by_kind(symbols, "Gadget").is_empty());
    }

    #[test]
    fn signature_only_formatting_never_includes_a_range() {
        let formatted = format_symbols(vec![sym("Render", symbol_kind::METHOD)], true);
        assert_eq!(formatted.len(), 1);
        assert_eq!(formatted[0].signature.as_deref(), Some("detail of Render"));

        let value = serde_json::to_value(&formatted[0]).unwrap();
        assert!(value.get("range").is_none());
        assert!(value.get("detail").is_none());
        assert_eq!(value["kind"], json!("Method"));
    }

    #[test]
    fn full_formatting_always_includes_a_range() {
        let formatted = format_symbols(vec![sym("Render", symbol_kind::METHOD)], false);
        let value = serde_json::to_value(&formatted[0]).unwrap();
        assert!(value.get("range").is_some());
        assert_eq!(value["detail"], json!("detail of Render"));
        assert!(value.get("signature").is_none());
    }

    #[test]
    fn flattening_puts_parents_before_children_in_source_order() {
        let tree = json!([{
            "name": "App",
            "kind": 3,
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 9, "character": 1 } },
            "selectionRange": { "start": { "line": 0, "character": 10 }, "end": { "line": 0, "character": 13 } },
            "children": [{
                "name": "Widget",
                "kind": 5,
                "range": { "start": { "line": 1, "character": 0 }, "end": { "line": 8, "character": 1 } },
                "selectionRange": { "start": { "line": 1, "character": 6 }, "end": { "line": 1, "character": 12 } },
                "children": [
                    {
                        "name": "Render",
                        "kind": 6,
                        "detail": "void Render()",
                        "range": { "start": { "line": 2, "character": 0 }, "end": { "line": 4, "character": 1 } },
                        "selectionRange": { "start": { "line": 2, "character": 5 }, "end": { "line": 2, "character": 11 } }
                    },
                    {
                        "name": "Update",
                        "kind": 6,
                        "range": { "start": { "line": 5, "character": 0 }, "end": { "line": 7, "character": 1 } },
                        "selectionRange": { "start": { "line": 5, "character": 5 }, "end": { "line": 5, "character": 11 } }
                    }
                ]
            }]
        }]);

        let flat = parse_symbols(tree).unwrap();
        let names: Vec<&str> = flat.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["App", "Widget", "Render", "Update"]);
        assert_eq!(flat[2].detail.as_deref(), Some("void Render()"));
    }

    #[test]
    fn parse_symbols_accepts_the_flat_symbol_information_shape() {
        let flat = parse_symbols(json!([{
            "name": "Render",
            "kind": 6,
            "location": {
                "uri": "file:///work/src/Widget.cs",
                "range": { "start": { "line": 2, "character": 0 }, "end": { "line": 4, "character": 1 } }
            }
        }]))
        .unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].name, "Render");
        assert!(flat[0].detail.is_none());
    }

    #[test]
    fn location_results_accept_locations_links_and_null() {
        assert!(parse_location_results(json!(null)).unwrap().is_empty());

        let from_location = parse_location_results(json!({
            "uri": "file:///work/src/Widget.cs",
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 0 } }
        }))
        .unwrap();
        assert_eq!(from_location[0].uri, "file:///work/src/Widget.cs");

        let from_links = parse_location_results(json!([{
            "targetUri": "csharp:/metadata/projects/App/assemblies/System.Runtime/symbols/System.Int32.cs",
            "targetRange": { "start": { "line": 0, "character": 0 }, "end": { "line": 90, "character": 0 } },
            "targetSelectionRange": { "start": { "line": 20, "character": 18 }, "end": { "line": 20, "character": 23 } }
        }]))
        .unwrap();
        assert!(from_links[0].uri.contains("System.Int32"));
    }
}
