use crate::core::InitInfo;

/// Renders the capability and version report printed by `info`.
pub fn render_info(info: &InitInfo) -> String {
    let mut lines = vec![
        format!("threads: {}", enabled(info.threads_enabled)),
        format!("quantization module: {}", enabled(info.secondary_enabled)),
        format!("quantization threads: {}", enabled(info.secondary_threads_enabled)),
    ];
    lines.extend(
        info.versions
            .describe()
            .into_iter()
            .map(|(component, version)| format!("{component}: {version}")),
    );
    lines.join("\n")
}

fn enabled(flag: bool) -> &'static str {
    if flag { "enabled" } else { "disabled" }
}
