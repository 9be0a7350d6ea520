use crate::config::WebpConfig;

/// Translates the configuration into the external tool's flag vocabulary.
///
/// The list is computed once at middleware construction and shared read-only
/// across requests; nothing here is validated beyond what the tool itself
/// rejects at invocation time.
pub fn compile_flags(config: &WebpConfig) -> Vec<String> {
    let mut flags = Vec::new();

    if let Some(q) = config.quality {
        flags.push("-q".to_string());
        flags.push(q.to_string());
    }
    if let Some(m) = config.method {
        flags.push("-m".to_string());
        flags.push(m.to_string());
    }
    if config.lossless {
        flags.push("-lossless".to_string());
    }
    if config.multithread {
        flags.push("-mt".to_string());
    }
    if let Some((w, h)) = config.resize {
        flags.push("-resize".to_string());
        flags.push(w.to_string());
        flags.push(h.to_string());
    }
    if let Some(ref meta) = config.metadata {
        flags.push("-metadata".to_string());
        flags.push(meta.clone());
    }

    flags.extend(config.extra_flags.iter().cloned());

    flags
}
