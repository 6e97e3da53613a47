use std::{path::PathBuf, time::Duration};

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use neoxport::{
    convert::{ConversionReport, ConversionRequest, convert},
    remapper::ShardKind,
};

fn format_report(report: &ConversionReport) -> String {
    let style_summary = Style::new().bold();
    let style_keys = if report.load_report.is_exact() {
        Style::new()
    } else {
        Style::new().yellow()
    };

    let summary = style_summary.apply_to(format!(
        "Converted {} layers, {} tensors",
        report.num_layers, report.num_tensors
    ));
    let missing = style_keys.apply_to(format!("missing keys: {:?}", report.load_report.missing_keys));
    let unexpected = style_keys.apply_to(format!("unexpected keys: {:?}", report.load_report.unexpected_keys));
    format!("{missing}\n{unexpected}\n\n{summary}")
}

pub fn handle_convert(
    checkpoint_dir: String,
    hf_config_path: String,
    hf_save_dir: String,
) -> Result<(), String> {
    let request = ConversionRequest {
        checkpoint_dir: PathBuf::from(checkpoint_dir),
        destination_config_path: PathBuf::from(hf_config_path),
        save_dir: PathBuf::from(hf_save_dir),
    };
    if !request.checkpoint_dir.is_dir() {
        return Err(format!("checkpoint directory not found: {}", request.checkpoint_dir.display()));
    }
    if !request.destination_config_path.is_file() {
        return Err(format!("config not found: {}", request.destination_config_path.display()));
    }

    tracing::debug!("{request:?}");

    let progress_bar = ProgressBar::new_spinner();
    progress_bar.enable_steady_tick(Duration::from_millis(100));
    progress_bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{pos}] {msg}")
            .map_err(|error| format!("invalid progress template: {error}"))?,
    );
    progress_bar.set_message("Remapping shards");

    let result = convert(&request, |kind: ShardKind| {
        progress_bar.inc(1);
        progress_bar.set_message(format!("Remapped {kind} shard"));
    });
    progress_bar.finish_and_clear();

    let report = result.map_err(|error| format!("conversion failed: {error}"))?;
    println!("{}", format_report(&report));
    println!("Saved to {}", request.save_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use neoxport::model::LoadReport;

    use super::*;

    #[test]
    fn report_lists_missing_and_unexpected_keys() {
        let report = ConversionReport {
            num_layers: 2,
            num_tensors: 28,
            load_report: LoadReport {
                missing_keys: vec!["transformer.h.2.ln_1.weight".to_string()],
                unexpected_keys: vec!["transformer.h.1.mlp.fc_out.bias".to_string()],
            },
        };

        let text = console::strip_ansi_codes(&format_report(&report)).to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], r#"missing keys: ["transformer.h.2.ln_1.weight"]"#);
        assert_eq!(lines[1], r#"unexpected keys: ["transformer.h.1.mlp.fc_out.bias"]"#);
        assert_eq!(lines.last(), Some(&"Converted 2 layers, 28 tensors"));
    }

    #[test]
    fn exact_report_prints_empty_lists() {
        let report = ConversionReport {
            num_layers: 1,
            num_tensors: 16,
            load_report: LoadReport::default(),
        };

        let text = console::strip_ansi_codes(&format_report(&report)).to_string();
        assert!(text.contains("missing keys: []\nunexpected keys: []"), "{text}");
    }

    #[test]
    fn missing_checkpoint_dir_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope").display().to_string();
        let err = handle_convert(missing, "config.json".into(), dir.path().display().to_string()).unwrap_err();
        assert!(err.starts_with("checkpoint directory not found"));
    }

    #[test]
    fn missing_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint_dir = dir.path().display().to_string();
        let config = dir.path().join("config.json").display().to_string();
        let err = handle_convert(checkpoint_dir.clone(), config, checkpoint_dir).unwrap_err();
        assert!(err.starts_with("config not found"));
    }

    #[test]
    fn conversion_error_is_mapped_to_message() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(&config, r#"{"n_layer": 1, "n_embd": 4, "vocab_size": 8}"#).unwrap();
        let save_dir = dir.path().join("out");

        let err = handle_convert(
            dir.path().display().to_string(),
            config.display().to_string(),
            save_dir.display().to_string(),
        )
        .unwrap_err();
        assert!(err.starts_with("conversion failed"), "{err}");
        assert!(!save_dir.exists());
    }
}
