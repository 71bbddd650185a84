//! BLAKE3 fingerprints for resource requests.

/// Hash components separated by NUL bytes. Returns `"blake3:{hex}"`.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Deterministic text encoding of a YAML value: mapping entries are sorted by
/// their encoded key, strings are quoted, so `{a: 1, b: 2}` and `{b: 2, a: 1}`
/// encode identically while `"1"` and `1` do not.
pub fn canonical_yaml(value: &serde_yaml_ng::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_yaml_ng::Value, out: &mut String) {
    use serde_yaml_ng::Value;
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push('"');
            for ch in s.chars() {
                match ch {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
        Value::Sequence(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Mapping(map) => {
            let mut entries: Vec<(String, String)> = map
                .iter()
                .map(|(k, v)| (canonical_yaml(k), canonical_yaml(v)))
                .collect();
            entries.sort();
            out.push('{');
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(k);
                out.push(':');
                out.push_str(v);
            }
            out.push('}');
        }
        Value::Tagged(tagged) => {
            out.push_str(&tagged.tag.to_string());
            out.push(' ');
            write_canonical(&tagged.value, out);
        }
    }
}

/// Fingerprint of a resource request after upstream substitution.
pub fn fingerprint_request(
    resource_type: &str,
    class: &str,
    id: &str,
    params: &indexmap::IndexMap<String, serde_yaml_ng::Value>,
) -> String {
    let mut map = serde_yaml_ng::Mapping::new();
    for (k, v) in params {
        map.insert(serde_yaml_ng::Value::String(k.clone()), v.clone());
    }
    let encoded = canonical_yaml(&serde_yaml_ng::Value::Mapping(map));
    composite_hash(&[resource_type, class, id, &encoded])
}

/// Stable 32-hex-digit token derived from a seed, for generated names and
/// passwords that must not change between runs.
pub fn stable_token(seed: &str) -> String {
    let hex = blake3::hash(seed.as_bytes()).to_hex();
    hex.as_str()[..32].to_string()
}
