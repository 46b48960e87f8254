//! C3 — Tech Stack Detector.
//!
//! Polymorphic over an ordered sequence of per-stack probes; the first
//! match wins. Grounded on the teacher's capability-trait style
//! (`environment::traits::ProcessEnvironment`), generalized here to a small
//! "does this workspace match me" probe registry, per the redesign note in
//! spec section 9 ("polymorphism via duck-typed adapters becomes a
//! capability set ordered by numeric priority").

use std::path::Path;

use serde::Serialize;

use crate::ports::Stack;

#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub stack: Stack,
    pub launch_command: String,
    pub default_port: Option<u16>,
    pub framework_tag: String,
}

pub trait StackProbe: Send + Sync {
    fn matches(&self, workspace: &Path) -> Option<Detection>;
}

struct NodeProbe;
impl StackProbe for NodeProbe {
    fn matches(&self, workspace: &Path) -> Option<Detection> {
        let pkg_path = workspace.join("package.json");
        let raw = std::fs::read_to_string(&pkg_path).ok()?;
        let json: serde_json::Value = serde_json::from_str(&raw).ok()?;
        let scripts = json.get("scripts")?.as_object()?;

        let (script_name, command) = scripts
            .get("dev")
            .map(|v| ("dev", v))
            .or_else(|| scripts.get("start").map(|v| ("start", v)))?;
        let command = command.as_str()?.to_string();

        let is_vite = command.contains("vite")
            || json
                .get("devDependencies")
                .and_then(|d| d.get("vite"))
                .is_some();

        Some(Detection {
            stack: if is_vite { Stack::Vite } else { Stack::Node },
            launch_command: format!("npm run {script_name}"),
            default_port: detect_port(&command),
            framework_tag: if is_vite {
                "vite".to_string()
            } else {
                "node".to_string()
            },
        })
    }
}

struct PythonProbe;
impl StackProbe for PythonProbe {
    fn matches(&self, workspace: &Path) -> Option<Detection> {
        let has_requirements = workspace.join("requirements.txt").exists();
        let has_pyproject = workspace.join("pyproject.toml").exists();
        let app_py = workspace.join("app.py");
        if !has_requirements && !has_pyproject && !app_py.exists() {
            return None;
        }
        let launch_command = if app_py.exists() {
            "python app.py".to_string()
        } else if workspace.join("manage.py").exists() {
            "python manage.py runserver".to_string()
        } else {
            "python -m http.server".to_string()
        };
        Some(Detection {
            stack: Stack::Python,
            default_port: detect_port(&launch_command),
            launch_command,
            framework_tag: "python".to_string(),
        })
    }
}

struct PhpProbe;
impl StackProbe for PhpProbe {
    fn matches(&self, workspace: &Path) -> Option<Detection> {
        let has_composer = workspace.join("composer.json").exists();
        let has_index = workspace.join("index.php").exists();
        if !has_composer && !has_index {
            return None;
        }
        Some(Detection {
            stack: Stack::Php,
            launch_command: "php -S 0.0.0.0:8080".to_string(),
            default_port: Some(8080),
            framework_tag: "php".to_string(),
        })
    }
}

struct RubyProbe;
impl StackProbe for RubyProbe {
    fn matches(&self, workspace: &Path) -> Option<Detection> {
        let gemfile = workspace.join("Gemfile");
        if !gemfile.exists() {
            return None;
        }
        let contents = std::fs::read_to_string(&gemfile).unwrap_or_default();
        let (command, tag) = if contents.contains("rails") {
            ("bin/rails server", "rails")
        } else if contents.contains("sinatra") || workspace.join("config.ru").exists() {
            ("rackup", "rack")
        } else {
            ("ruby app.rb", "plain")
        };
        Some(Detection {
            stack: Stack::Ruby,
            launch_command: command.to_string(),
            default_port: detect_port(command),
            framework_tag: tag.to_string(),
        })
    }
}

struct GoProbe;
impl StackProbe for GoProbe {
    fn matches(&self, workspace: &Path) -> Option<Detection> {
        if !workspace.join("go.mod").exists() {
            return None;
        }
        Some(Detection {
            stack: Stack::Go,
            launch_command: "go run .".to_string(),
            default_port: None,
            framework_tag: "go".to_string(),
        })
    }
}

struct RustProbe;
impl StackProbe for RustProbe {
    fn matches(&self, workspace: &Path) -> Option<Detection> {
        if !workspace.join("Cargo.toml").exists() {
            return None;
        }
        Some(Detection {
            stack: Stack::Rust,
            launch_command: "cargo run".to_string(),
            default_port: None,
            framework_tag: "cargo".to_string(),
        })
    }
}

struct JavaProbe;
impl StackProbe for JavaProbe {
    fn matches(&self, workspace: &Path) -> Option<Detection> {
        let maven = workspace.join("pom.xml").exists();
        let gradle =
            workspace.join("build.gradle").exists() || workspace.join("build.gradle.kts").exists();
        if !maven && !gradle {
            return None;
        }
        Some(Detection {
            stack: Stack::Java,
            launch_command: if maven {
                "mvn spring-boot:run".to_string()
            } else {
                "./gradlew bootRun".to_string()
            },
            default_port: None,
            framework_tag: if maven { "maven" } else { "gradle" }.to_string(),
        })
    }
}

struct DotnetProbe;
impl StackProbe for DotnetProbe {
    fn matches(&self, workspace: &Path) -> Option<Detection> {
        let has_csproj = std::fs::read_dir(workspace)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .any(|e| e.path().extension().map(|ext| ext == "csproj").unwrap_or(false))
            })
            .unwrap_or(false);
        if !has_csproj {
            return None;
        }
        Some(Detection {
            stack: Stack::Dotnet,
            launch_command: "dotnet run".to_string(),
            default_port: None,
            framework_tag: "dotnet".to_string(),
        })
    }
}

struct StaticProbe;
impl StackProbe for StaticProbe {
    fn matches(&self, workspace: &Path) -> Option<Detection> {
        if workspace.join("index.html").exists() {
            Some(Detection {
                stack: Stack::Static,
                launch_command: "npx serve .".to_string(),
                default_port: Some(4000),
                framework_tag: "static".to_string(),
            })
        } else {
            None
        }
    }
}

/// Extracts a port hint from a launch command: `--port N`, `PORT=N`, or
/// `:N`. Returns `None` when no such hint is present — the detector never
/// invents a port, it only proposes one when the command states it.
pub fn detect_port(script: &str) -> Option<u16> {
    let patterns = [
        regex::Regex::new(r"--port[=\s]+(\d+)").unwrap(),
        regex::Regex::new(r"PORT=(\d+)").unwrap(),
        regex::Regex::new(r":(\d{2,5})\b").unwrap(),
    ];
    for pattern in &patterns {
        if let Some(caps) = pattern.captures(script) {
            if let Ok(port) = caps[1].parse::<u16>() {
                return Some(port);
            }
        }
    }
    None
}

/// Ordered detector registry; detection order is total, first match wins.
pub struct Detector {
    probes: Vec<Box<dyn StackProbe>>,
}

impl Detector {
    pub fn new() -> Self {
        Self {
            probes: vec![
                Box::new(NodeProbe),
                Box::new(PythonProbe),
                Box::new(PhpProbe),
                Box::new(RubyProbe),
                Box::new(GoProbe),
                Box::new(RustProbe),
                Box::new(JavaProbe),
                Box::new(DotnetProbe),
                Box::new(StaticProbe),
            ],
        }
    }

    /// Inspects `workspace` and returns the first matching probe's
    /// detection, or `None` if nothing matched. Never mutates the
    /// workspace.
    pub fn detect(&self, workspace: &Path) -> Option<Detection> {
        self.probes.iter().find_map(|probe| probe.matches(workspace))
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn detects_node_dev_script() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "next dev --port 3005"}}"#,
        )
        .unwrap();
        let detection = Detector::new().detect(dir.path()).unwrap();
        assert_eq!(detection.stack, Stack::Node);
        assert_eq!(detection.default_port, Some(3005));
    }

    #[test]
    fn detects_vite_over_plain_node() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "vite"}, "devDependencies": {"vite": "^5"}}"#,
        )
        .unwrap();
        let detection = Detector::new().detect(dir.path()).unwrap();
        assert_eq!(detection.stack, Stack::Vite);
    }

    #[test]
    fn falls_through_to_static() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        let detection = Detector::new().detect(dir.path()).unwrap();
        assert_eq!(detection.stack, Stack::Static);
    }

    #[test]
    fn no_match_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Detector::new().detect(dir.path()).is_none());
    }

    #[test]
    fn detect_port_variants() {
        assert_eq!(detect_port("app --port 9001"), Some(9001));
        assert_eq!(detect_port("PORT=9002 node server.js"), Some(9002));
        assert_eq!(detect_port("serve on :9003"), Some(9003));
        assert_eq!(detect_port("no hints here"), None);
    }
}
