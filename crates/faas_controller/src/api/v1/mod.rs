pub mod function;
pub mod profile;

pub use function::{Function, FunctionResources, FunctionSpec};
pub use profile::{Profile, ProfileSpec};

/// Schema for embedded core/v1 objects that the apiserver validates itself.
pub fn preserve_unknown_object_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "object",
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true,
    }))
    .unwrap()
}

pub fn preserve_unknown_array_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "array",
        "nullable": true,
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true,
        },
    }))
    .unwrap()
}
