//! Dev-process discovery from project config files.
//!
//! An optional LLM helper classifies `package.json` / `pyproject.toml`
//! scripts; without it a fixed heuristic maps common stacks to their
//! default dev command and port. Either way the result is filtered so
//! one-shot scripts (tests, builds, migrations) are never registered as
//! long-running processes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredProcess {
    pub name: String,
    pub command: String,
    pub description: String,
    #[serde(default)]
    pub default_port: Option<u16>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Script names/commands that are one-shot, never dev servers.
const NON_DEV_KEYWORDS: &[&str] = &[
    "test", "build", "lint", "format", "typecheck", "generate", "seed", "migrate", "install",
    "clean",
];

fn looks_like_dev_process(name: &str, command: &str) -> bool {
    let name = name.to_lowercase();
    let command = command.to_lowercase();
    !NON_DEV_KEYWORDS
        .iter()
        .any(|kw| name.contains(kw) || command.starts_with(&format!("npm run {kw}")))
}

/// Discover dev processes for a project: LLM helper when configured,
/// heuristics otherwise (and as fallback when the helper fails).
pub async fn discover(project_path: &str, llm_endpoint: Option<&str>) -> Vec<DiscoveredProcess> {
    if let Some(endpoint) = llm_endpoint {
        let files = read_project_files(project_path);
        if !files.is_empty() {
            match analyze_with_llm(endpoint, project_path, &files).await {
                Ok(processes) if !processes.is_empty() => {
                    return processes
                        .into_iter()
                        .filter(|p| looks_like_dev_process(&p.name, &p.command))
                        .collect();
                }
                Ok(_) => {}
                Err(e) => warn!("LLM process discovery failed, using heuristics: {e}"),
            }
        }
    }
    analyze_with_heuristics(project_path)
}

/// Read the config files the classifier looks at, size-capped.
fn read_project_files(project_path: &str) -> Vec<(String, String)> {
    let path = Path::new(project_path);
    let mut files = Vec::new();

    for filename in [
        "package.json",
        "pyproject.toml",
        "Makefile",
        "docker-compose.yml",
        "docker-compose.yaml",
    ] {
        if let Ok(content) = std::fs::read_to_string(path.join(filename)) {
            files.push((filename.to_string(), truncate(&content, 5000)));
        }
    }

    for subdir in ["frontend", "backend", "client", "server", "api", "worker"] {
        for filename in ["package.json", "pyproject.toml"] {
            let file_path = path.join(subdir).join(filename);
            if let Ok(content) = std::fs::read_to_string(&file_path) {
                files.push((format!("{subdir}/{filename}"), truncate(&content, 3000)));
            }
        }
    }

    files
}

fn truncate(s: &str, max: usize) -> String {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Ask a local model (Ollama-style generate API) to classify the project's
/// runnable dev processes.
async fn analyze_with_llm(
    endpoint: &str,
    project_path: &str,
    files: &[(String, String)],
) -> crate::Result<Vec<DiscoveredProcess>> {
    let mut prompt = format!(
        "Analyze this project's configuration files and identify the \
         long-running dev processes that can be started.\n\nProject: {project_path}\n\nFiles:\n"
    );
    for (filename, content) in files {
        prompt.push_str(&format!("\n--- {filename} ---\n{content}\n"));
    }
    prompt.push_str(
        "\nReturn ONLY a JSON array, no other text. Each element: \
         {\"name\": ..., \"command\": ..., \"description\": ..., \
          \"default_port\": <number or null>, \"cwd\": <subdirectory or null>}.\n\
         Include only processes that keep running (dev servers, workers, queues); \
         exclude test, build, lint, format, typecheck, generate, seed, migrate, \
         install and clean commands.",
    );

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/generate", endpoint.trim_end_matches('/')))
        .json(&serde_json::json!({
            "model": "llama3.2",
            "prompt": prompt,
            "stream": false,
        }))
        .send()
        .await?
        .error_for_status()?;

    let body: serde_json::Value = response.json().await?;
    let text = body["response"].as_str().unwrap_or_default();

    // The model may wrap the array in prose; take the outermost brackets.
    let start = text.find('[');
    let end = text.rfind(']');
    let (Some(start), Some(end)) = (start, end) else {
        return Ok(Vec::new());
    };
    if end < start {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&text[start..=end]).unwrap_or_default())
}

/// Fixed-stack fallback: frontend/backend subdirectories first, project
/// root for single-app layouts.
fn analyze_with_heuristics(project_path: &str) -> Vec<DiscoveredProcess> {
    let path = Path::new(project_path);
    let mut services = Vec::new();

    for dir in ["frontend", "client", "web", "ui"] {
        let subpath = path.join(dir);
        if subpath.is_dir() {
            if let Some((command, port)) = detect_dev_command(&subpath) {
                services.push(DiscoveredProcess {
                    name: "frontend".to_string(),
                    command,
                    description: format!("Frontend dev server ({dir}/)"),
                    default_port: Some(port),
                    cwd: Some(dir.to_string()),
                });
            }
            break;
        }
    }

    for dir in ["backend", "server", "api"] {
        let subpath = path.join(dir);
        if subpath.is_dir() {
            if let Some((command, port)) = detect_dev_command(&subpath) {
                services.push(DiscoveredProcess {
                    name: "backend".to_string(),
                    command,
                    description: format!("Backend dev server ({dir}/)"),
                    default_port: Some(port),
                    cwd: Some(dir.to_string()),
                });
            }
            break;
        }
    }

    if services.is_empty() {
        if let Some((command, port)) = detect_dev_command(path) {
            services.push(DiscoveredProcess {
                name: "app".to_string(),
                command,
                description: "Project dev server".to_string(),
                default_port: Some(port),
                cwd: None,
            });
        }
    }

    services
}

/// Map a directory to its default dev command and port.
pub fn detect_dev_command(path: &Path) -> Option<(String, u16)> {
    if let Ok(content) = std::fs::read_to_string(path.join("package.json")) {
        if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&content) {
            let scripts = pkg.get("scripts").and_then(|s| s.as_object());
            if let Some(scripts) = scripts {
                if let Some(dev) = scripts.get("dev").and_then(|d| d.as_str()) {
                    let port = script_port(dev)
                        .or_else(|| dev.contains("vite").then_some(5173))
                        .unwrap_or(3000);
                    return Some(("npm run dev".to_string(), port));
                }
                if scripts.contains_key("start") {
                    return Some(("npm start".to_string(), 3000));
                }
            }
        }
    }

    let has_py_entry = path.join("main.py").exists() || path.join("app.py").exists();
    if has_py_entry {
        if let Ok(reqs) = std::fs::read_to_string(path.join("requirements.txt")) {
            let reqs = reqs.to_lowercase();
            let entry = if path.join("main.py").exists() { "main" } else { "app" };
            if reqs.contains("fastapi") || reqs.contains("uvicorn") {
                return Some((format!("uvicorn {entry}:app --reload --port 8000"), 8000));
            }
            if reqs.contains("flask") {
                return Some(("flask run --reload --port 5000".to_string(), 5000));
            }
            if reqs.contains("django") {
                return Some(("python manage.py runserver 8000".to_string(), 8000));
            }
        }
    }

    if let Ok(content) = std::fs::read_to_string(path.join("pyproject.toml")) {
        let content = content.to_lowercase();
        if content.contains("fastapi") {
            return Some(("uvicorn main:app --reload --port 8000".to_string(), 8000));
        }
        if content.contains("flask") {
            return Some(("flask run --reload --port 5000".to_string(), 5000));
        }
        if content.contains("django") {
            return Some(("python manage.py runserver 8000".to_string(), 8000));
        }
    }

    None
}

/// Extract `--port N` from a script string.
fn script_port(script: &str) -> Option<u16> {
    let idx = script.find("--port")?;
    script[idx + "--port".len()..]
        .trim_start_matches(['=', ' '])
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vite_project_maps_to_npm_run_dev() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "vite", "build": "vite build"}}"#,
        )
        .unwrap();
        let (command, port) = detect_dev_command(dir.path()).unwrap();
        assert_eq!(command, "npm run dev");
        assert_eq!(port, 5173);
    }

    #[test]
    fn explicit_port_in_script_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "next dev --port 4001"}}"#,
        )
        .unwrap();
        let (_, port) = detect_dev_command(dir.path()).unwrap();
        assert_eq!(port, 4001);
    }

    #[test]
    fn fastapi_project_maps_to_uvicorn() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "app = None\n").unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "fastapi\nuvicorn\n").unwrap();
        let (command, port) = detect_dev_command(dir.path()).unwrap();
        assert!(command.starts_with("uvicorn main:app"));
        assert_eq!(port, 8000);
    }

    #[test]
    fn unknown_project_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_dev_command(dir.path()).is_none());
    }

    #[test]
    fn non_dev_scripts_are_filtered() {
        assert!(!looks_like_dev_process("test", "vitest run"));
        assert!(!looks_like_dev_process("db:migrate", "prisma migrate dev"));
        assert!(!looks_like_dev_process("worker", "npm run build"));
        assert!(looks_like_dev_process("frontend", "npm run dev"));
        assert!(looks_like_dev_process("worker", "node worker.js"));
    }

    /// Serve a canned Ollama-style reply on an ephemeral port.
    async fn stub_llm(response_text: &'static str) -> String {
        use axum::routing::post;
        let app = axum::Router::new().route(
            "/api/generate",
            post(move || async move {
                axum::Json(serde_json::json!({"response": response_text}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn llm_discovery_extracts_wrapped_json_and_filters() {
        let endpoint = stub_llm(concat!(
            "Here are the runnable processes:\n",
            r#"[{"name": "frontend", "command": "npm run dev", "description": "Vite dev server", "default_port": 5173, "cwd": null},"#,
            r#" {"name": "test", "command": "vitest", "description": "test runner", "default_port": null, "cwd": null}]"#,
            "\nLet me know if you need more detail.",
        ))
        .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "vite", "test": "vitest"}}"#,
        )
        .unwrap();

        let found = discover(dir.path().to_str().unwrap(), Some(&endpoint)).await;
        // The one-shot "test" entry is filtered out.
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "frontend");
        assert_eq!(found[0].command, "npm run dev");
        assert_eq!(found[0].default_port, Some(5173));
    }

    #[tokio::test]
    async fn llm_reply_without_json_array_falls_back_to_heuristics() {
        let endpoint = stub_llm("I could not find any processes, sorry.").await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "vite"}}"#,
        )
        .unwrap();

        let found = discover(dir.path().to_str().unwrap(), Some(&endpoint)).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].command, "npm run dev");
        assert_eq!(found[0].default_port, Some(5173));
    }

    #[tokio::test]
    async fn unreachable_llm_endpoint_falls_back_to_heuristics() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "vite"}}"#,
        )
        .unwrap();

        // Discard port: the connection is refused immediately.
        let found = discover(dir.path().to_str().unwrap(), Some("http://127.0.0.1:9")).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].command, "npm run dev");
    }

    #[tokio::test]
    async fn heuristics_find_frontend_and_backend() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("frontend")).unwrap();
        std::fs::create_dir_all(dir.path().join("backend")).unwrap();
        std::fs::write(
            dir.path().join("frontend/package.json"),
            r#"{"scripts": {"dev": "vite"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("backend/main.py"), "").unwrap();
        std::fs::write(dir.path().join("backend/requirements.txt"), "fastapi").unwrap();

        let found = discover(dir.path().to_str().unwrap(), None).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "frontend");
        assert_eq!(found[0].cwd.as_deref(), Some("frontend"));
        assert_eq!(found[1].name, "backend");
    }
}
