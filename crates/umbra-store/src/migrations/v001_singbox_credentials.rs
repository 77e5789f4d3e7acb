//! Schema 0 -> 1: every user gains ShadowTLS, Shadowsocks, Hysteria2 and
//! TUIC credentials.
//!
//! Works on the raw JSON so that records which would not yet deserialize
//! are still upgraded. Existing values are never touched.

use serde_json::{Map, Value};
use umbra_shared::{CredentialFactory, IdentifierIndex};

const SECRET_FIELDS: [&str; 4] = [
    "shadowtls_password",
    "shadowsocks_password",
    "hysteria2_password",
    "tuic_password",
];

pub fn up(document: &mut Value, factory: &CredentialFactory) -> Result<(), String> {
    let root = document
        .as_object_mut()
        .ok_or("store document is not a JSON object")?;

    if let Some(users) = root.get_mut("users") {
        let users = users.as_object_mut().ok_or("`users` is not an object")?;
        let mut taken = index_values(users)?;

        for (username, record) in users.iter_mut() {
            let fields = record
                .as_object_mut()
                .ok_or_else(|| format!("user record '{username}' is not an object"))?;

            for field in SECRET_FIELDS {
                if is_missing(fields, field) {
                    let secret = factory
                        .fresh_secret(field, &mut taken)
                        .map_err(|e| e.to_string())?;
                    fields.insert(field.to_string(), Value::String(secret));
                }
            }
            if is_missing(fields, "tuic_uuid") {
                let uuid = factory
                    .fresh_uuid("tuic_uuid", &mut taken)
                    .map_err(|e| e.to_string())?;
                fields.insert("tuic_uuid".to_string(), Value::String(uuid.to_string()));
            }
        }
    }

    root.insert("schema_version".to_string(), Value::from(1u32));
    Ok(())
}

fn is_missing(fields: &Map<String, Value>, field: &str) -> bool {
    matches!(fields.get(field), None | Some(Value::Null))
}

/// Every string already present in any user record.
fn index_values(users: &Map<String, Value>) -> Result<IdentifierIndex, String> {
    let mut index = IdentifierIndex::new();
    for (username, record) in users {
        let fields = record
            .as_object()
            .ok_or_else(|| format!("user record '{username}' is not an object"))?;
        index.insert_username(username);
        for value in fields.values().filter_map(Value::as_str) {
            index.insert_value(value);
        }
    }
    Ok(index)
}
