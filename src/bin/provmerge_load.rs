use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use provmerge::config::{ConfigOverrides, LedgerOverrides};
use provmerge::{LoadType, MergeConfig, Reconciler, Record};
use serde::Deserialize;
use tracing::{info, warn};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

/// One line of the input file
#[derive(Debug, Deserialize)]
struct Delivery {
    /// Name of the delivering source
    source: String,
    /// Skeleton source name, defaults to `source`
    #[serde(default)]
    skeleton_source: Option<String>,
    #[serde(default = "default_load")]
    load: LoadType,
    record: Record,
}

fn default_load() -> LoadType {
    LoadType::Source
}

fn parse_delivery(line: &str) -> anyhow::Result<Delivery> {
    let delivery: Delivery = serde_json::from_str(line)?;
    if delivery.source.is_empty() {
        bail!("delivery has an empty source name");
    }
    if delivery.record.facets.is_empty() {
        bail!("record has no facets");
    }
    Ok(delivery)
}

#[derive(Debug, Default)]
struct Summary {
    stored: usize,
    short_circuited: usize,
    deleted: usize,
}

fn load(reconciler: &mut Reconciler, input: &str) -> anyhow::Result<Summary> {
    let mut summary = Summary::default();
    for (index, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let delivery =
            parse_delivery(line).with_context(|| format!("invalid delivery on line {}", index + 1))?;
        let source = reconciler.main_source(&delivery.source)?;
        let skeleton_name = delivery.skeleton_source.as_deref().unwrap_or(&delivery.source);
        let skeleton = reconciler.skeleton_source(skeleton_name)?;
        let outcome = reconciler
            .store_record(&delivery.record, &source, &skeleton, delivery.load)
            .with_context(|| format!("failed to store line {}", index + 1))?;
        summary.stored += 1;
        summary.deleted += outcome.deleted.len();
        if outcome.short_circuited {
            summary.short_circuited += 1;
        }
    }
    Ok(summary)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Some(input_path) = parse_arg("--input") else {
        bail!("usage: provmerge_load --input <records.jsonl> [--config <provmerge.toml>] [--ledger <dir>]");
    };
    let overrides = ConfigOverrides {
        ledger: parse_arg("--ledger").map(|path| LedgerOverrides {
            path: Some(PathBuf::from(path)),
            cache_capacity: None,
        }),
    };
    let config = MergeConfig::load(parse_arg("--config").as_deref(), overrides)?;
    let mut reconciler = Reconciler::from_config(&config)?;
    let input =
        fs::read_to_string(&input_path).with_context(|| format!("failed to read {input_path}"))?;

    reconciler.begin_transaction()?;
    let summary = match load(&mut reconciler, &input) {
        Ok(summary) => summary,
        Err(err) => {
            if let Err(abort) = reconciler.abort_transaction() {
                warn!(error = %abort, "abort after failed load also failed");
            }
            reconciler.close()?;
            return Err(err);
        }
    };
    reconciler.commit_transaction()?;

    info!(
        stored = summary.stored,
        short_circuited = summary.short_circuited,
        deleted = summary.deleted,
        remapped = reconciler.remap().len(),
        "load complete"
    );
    println!(
        "stored {} records ({} unchanged, {} duplicates removed); {} records in store",
        summary.stored,
        summary.short_circuited,
        summary.deleted,
        reconciler.primary().len()
    );
    reconciler.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delivery_defaults() {
        let line = r#"{"source":"GenBank","record":{"facets":["Gene"],"fields":{"symbol":{"scalar":{"text":"eve"}}}}}"#;
        let delivery = parse_delivery(line).unwrap();
        assert_eq!(delivery.load, LoadType::Source);
        assert!(delivery.skeleton_source.is_none());
        assert_eq!(delivery.record.scalar("symbol").unwrap().as_text(), Some("eve"));
    }

    #[test]
    fn test_parse_delivery_rejects_missing_facets() {
        let line = r#"{"source":"GenBank","load":"skeleton","record":{"facets":[]}}"#;
        assert!(parse_delivery(line).is_err());
        assert!(parse_delivery("not json").is_err());
    }

    #[test]
    fn test_load_merges_lines_in_order() {
        let config = MergeConfig::from_toml_str(
            r#"
            [schema]
            Gene = [{ name = "symbol" }, { name = "name" }]

            [[identity_keys]]
            name = "symbol"
            facet = "Gene"
            fields = ["symbol"]

            [priorities]
            default = ["RefSeq", "GenBank"]
            "#,
        )
        .unwrap();
        let mut reconciler = Reconciler::from_config(&config).unwrap();
        let input = [
            r#"{"source":"GenBank","record":{"facets":["Gene"],"fields":{"symbol":{"scalar":{"text":"eve"}},"name":{"scalar":{"text":"even"}}}}}"#,
            "",
            r#"{"source":"RefSeq","record":{"facets":["Gene"],"fields":{"symbol":{"scalar":{"text":"eve"}},"name":{"scalar":{"text":"even skipped"}}}}}"#,
        ]
        .join("\n");

        let summary = load(&mut reconciler, &input).unwrap();
        assert_eq!(summary.stored, 2);
        assert_eq!(reconciler.primary().len(), 1);
    }
}
