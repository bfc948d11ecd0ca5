//! Graph definition files

use anyhow::{bail, Context};
use std::path::Path;
use steward_types::StepGraph;

/// Parse one YAML or JSON graph definition, chosen by extension
pub fn load_file(path: &Path) -> anyhow::Result<StepGraph> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading graph file {}", path.display()))?;
    let graph: StepGraph = match extension(path).as_deref() {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&text)
            .with_context(|| format!("parsing YAML graph {}", path.display()))?,
        Some("json") => serde_json::from_str(&text)
            .with_context(|| format!("parsing JSON graph {}", path.display()))?,
        _ => bail!("unsupported graph file extension: {}", path.display()),
    };
    graph
        .validate()
        .with_context(|| format!("validating graph {}", path.display()))?;
    Ok(graph)
}

/// Load every graph in `dir`, in file name order. Other files are ignored.
pub fn load_dir(dir: &Path) -> anyhow::Result<Vec<StepGraph>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("reading graphs directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && matches!(extension(&path).as_deref(), Some("yaml" | "yml" | "json")) {
            paths.push(path);
        }
    }
    paths.sort();
    paths.iter().map(|path| load_file(path)).collect()
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use steward_types::{GraphId, RejectionPolicy, StepId};

    const REFUND_YAML: &str = r#"
id: refund
name: Refund a customer
on_reject: skip_step
steps:
  - id: lookup
    kind: start
    action:
      kind: orders.lookup
  - id: refund
    action:
      kind: payment.refund
      effect: financial
      reversibility:
        type: irreversible
    approval:
      required_approvers: 2
  - id: notify
    kind: terminal
edges:
  - source: lookup
    target: refund
  - source: refund
    target: notify
"#;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("stewardd-graphs-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn loads_yaml_definition() {
        let dir = temp_dir("yaml");
        let path = dir.join("refund.yaml");
        std::fs::write(&path, REFUND_YAML).unwrap();

        let graph = load_file(&path).unwrap();
        assert_eq!(graph.id, GraphId::new("refund"));
        assert_eq!(graph.on_reject, RejectionPolicy::SkipStep);
        assert_eq!(graph.step_count(), 3);
        let refund = graph.get_step(&StepId::new("refund")).unwrap();
        assert_eq!(refund.approval.as_ref().unwrap().required_approvers, Some(2));
    }

    #[test]
    fn directory_loads_in_name_order_and_skips_other_files() {
        let dir = temp_dir("dir");
        let second = REFUND_YAML.replacen("id: refund\n", "id: second\n", 1);
        std::fs::write(dir.join("b.yml"), second).unwrap();
        std::fs::write(dir.join("a.yaml"), REFUND_YAML).unwrap();
        std::fs::write(dir.join("README.md"), "not a graph").unwrap();

        let graphs = load_dir(&dir).unwrap();
        let ids: Vec<_> = graphs.iter().map(|g| g.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["refund", "second"]);
    }

    #[test]
    fn invalid_graph_names_the_file() {
        let dir = temp_dir("invalid");
        let path = dir.join("broken.json");
        std::fs::write(
            &path,
            r#"{"id": "broken", "name": "broken", "steps": [{"id": "only", "kind": "task"}]}"#,
        )
        .unwrap();
        let err = load_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }
}
