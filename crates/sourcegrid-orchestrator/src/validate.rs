//! Definition checks applied before a definition is stored.

use sourcegrid_state::ConnectorDefinition;

/// Package reference schemes accepted for a connector archive.
pub const SUPPORTED_SCHEMES: &[&str] = &[
    "builtin://",
    "file://",
    "http://",
    "https://",
    "function://",
    "source://",
];

/// Check a definition for registration or as the target of an update.
///
/// Returns a message naming the first problem found.
pub fn validate_definition(def: &ConnectorDefinition) -> Result<(), String> {
    def.id.validate()?;

    let implementation = &def.implementation;
    if implementation.class_name.is_none() && implementation.archive.is_none() {
        return Err("either a class name or a package archive is required".to_string());
    }
    if let Some(class_name) = &implementation.class_name
        && class_name.trim().is_empty()
    {
        return Err("class name must not be blank".to_string());
    }
    if let Some(archive) = &implementation.archive
        && !SUPPORTED_SCHEMES.iter().any(|s| archive.starts_with(s))
    {
        return Err(format!("unsupported package reference '{archive}'"));
    }

    if def.topic.trim().is_empty() {
        return Err("destination topic is required".to_string());
    }
    if def.parallelism < 1 {
        return Err("parallelism must be at least 1".to_string());
    }

    let r = &def.resources;
    if !r.cpu.is_finite() || r.cpu <= 0.0 {
        return Err(format!("cpu must be positive, got {}", r.cpu));
    }
    if r.ram_bytes == 0 {
        return Err("ram must be positive".to_string());
    }
    if r.disk_bytes == 0 {
        return Err("disk must be positive".to_string());
    }

    if def.configs.keys().any(|k| k.trim().is_empty()) {
        return Err("config keys must not be blank".to_string());
    }
    if def.secrets.keys().any(|k| k.trim().is_empty()) {
        return Err("secret names must not be blank".to_string());
    }

    tracing::debug!(definition = %def.id, "definition validated");
    Ok(())
}
