use clap::{Parser, Subcommand, ValueEnum};
use persistmap::binding::{open_binding, AnyBinding, Backend, Binding};
use persistmap::{expiry, writer, JsonStore, JsonStoreOptions, RowStore, RowStoreOptions};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

/// persistmap CLI: read and write a persisted key-value binding
#[derive(Parser)]
#[command(name = "persistmap", version, about)]
struct Cli {
    /// Backing file: `.sqlite`, `.sqlite3` or `.db` for SQLite, anything else for JSON
    #[arg(long, default_value = "urls.sqlite")]
    file: PathBuf,

    /// Table to bind to (SQLite only; default: first table with a primary key)
    #[arg(long)]
    table: Option<String>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Get the value stored under a key
    Get {
        key: String,
        /// Delete the entry and report it absent if its expiry has passed
        #[arg(long)]
        evict_expired: bool,
    },

    /// Store a value under a key
    Set {
        key: String,
        /// Field values (e.g. --field fulllink=https://example.com)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        /// The whole value as JSON (overrides --field)
        #[arg(long)]
        json: Option<String>,
    },

    /// Delete a key
    Delete { key: String },

    /// Check whether a key is present
    Has { key: String },

    /// List every key
    Keys,

    /// Show the discovered table schema (SQLite only)
    Schema,

    /// Print the raw JSON document, read under a shared lock (JSON only)
    Dump,

    /// Keep a JSON binding open and watched until a termination signal
    Hold {
        /// Exit normally after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s.find('=').ok_or_else(|| {
        format!("Invalid key=value pair: no '=' found in '{s}'")
    })?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(0) => {}
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("ERROR:{e}");
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    match &cli.command {
        Command::Hold { seconds } => return hold(&cli.file, *seconds),
        Command::Dump => {
            let content = writer::read_shared(&cli.file)?;
            let doc: serde_json::Value = serde_json::from_str(&content)?;
            print_output(&doc, &cli.format)?;
            return Ok(0);
        }
        _ => {}
    }

    let binding = open(&cli)?;

    match &cli.command {
        Command::Get { key, evict_expired } => {
            let mut value = binding.get(key)?;
            if *evict_expired {
                if let Some(entry) = &value {
                    if expiry::is_expired(entry, chrono::Utc::now()) {
                        log::info!("Entry {key} has expired, deleting it");
                        binding.delete(key)?;
                        value = None;
                    }
                }
            }
            print_output(&value.unwrap_or(serde_json::Value::Null), &cli.format)?;
        }

        Command::Set { key, fields, json } => {
            let value = match json {
                Some(raw) => serde_json::from_str(raw)?,
                None => fields_to_value(fields),
            };
            binding.set(key, value)?;
            print_output(&serde_json::json!({ "ok": true, "key": key }), &cli.format)?;
        }

        Command::Delete { key } => {
            binding.delete(key)?;
            print_output(&serde_json::json!({ "ok": true, "deleted": key }), &cli.format)?;
        }

        Command::Has { key } => {
            let present = binding.has(key)?;
            print_output(&serde_json::json!({ "key": key, "present": present }), &cli.format)?;
        }

        Command::Keys => {
            let keys = binding.keys()?;
            print_output(&serde_json::json!(keys), &cli.format)?;
        }

        Command::Schema => {
            let store = binding
                .as_relational()
                .ok_or("schema is only available for SQLite targets")?;
            print_output(&serde_json::to_value(store.schema())?, &cli.format)?;
        }

        Command::Hold { .. } | Command::Dump => unreachable!("handled above"),
    }

    if let Some(store) = binding.as_json() {
        store.close()?;
    }
    Ok(0)
}

fn open(cli: &Cli) -> Result<AnyBinding, Box<dyn std::error::Error>> {
    let binding = match (Backend::for_path(&cli.file), &cli.table) {
        (Backend::Json, Some(_)) => {
            return Err("--table only applies to SQLite targets".into());
        }
        (Backend::Json, None) => {
            let options = JsonStoreOptions {
                watch: false,
                ..JsonStoreOptions::default()
            };
            AnyBinding::Json(JsonStore::open_with(&cli.file, options)?)
        }
        (Backend::Relational, Some(table)) => {
            let options = RowStoreOptions {
                table: Some(table.clone()),
                ..RowStoreOptions::default()
            };
            AnyBinding::Relational(RowStore::open_with(&cli.file, options)?)
        }
        (Backend::Relational, None) => open_binding(&cli.file)?,
    };
    Ok(binding)
}

/// Hold the JSON document open, reconciling external edits, until a
/// termination signal (or the optional timeout) arrives; then flush and
/// return the exit code of the shutdown hook.
fn hold(file: &Path, seconds: Option<u64>) -> Result<i32, Box<dyn std::error::Error>> {
    if Backend::for_path(file) != Backend::Json {
        return Err("hold only applies to JSON targets".into());
    }
    let store = JsonStore::open(file)?;
    let hook = store.shutdown_hook();
    log::info!("Holding {} ({} keys)", store.path().display(), store.len());

    let runtime = tokio::runtime::Runtime::new()?;
    let reason = runtime.block_on(async {
        match seconds {
            Some(secs) => tokio::select! {
                signal = wait_for_termination() => signal,
                _ = tokio::time::sleep(Duration::from_secs(secs)) => Ok("timeout"),
            },
            None => wait_for_termination().await,
        }
    })?;

    log::info!("Received {reason}, flushing {}", store.path().display());
    Ok(hook.run())
}

#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value)?);
        }
    }
    Ok(())
}

fn fields_to_value(fields: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, val) in fields {
        // Try to parse as JSON value (for numbers, booleans, arrays, objects)
        let json_val = serde_json::from_str(val).unwrap_or(serde_json::Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn run_with(file: &Path, args: &[&str]) -> Result<i32, Box<dyn std::error::Error>> {
        let mut argv = vec!["persistmap", "--format", "json", "--file", file.to_str().unwrap()];
        argv.extend_from_slice(args);
        run(Cli::try_parse_from(argv).unwrap())
    }

    fn on_disk(path: &Path) -> serde_json::Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("fulllink=https://x.io/?a=b").unwrap(),
            ("fulllink".to_string(), "https://x.io/?a=b".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
    }

    #[test]
    fn test_fields_to_value() {
        let fields = vec![
            ("fulllink".to_string(), "http://x".to_string()),
            ("hits".to_string(), "3".to_string()),
        ];
        assert_eq!(
            fields_to_value(&fields),
            serde_json::json!({"fulllink": "http://x", "hits": 3})
        );
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "persistmap", "--file", "urls.json", "set", "abc", "--field", "fulllink=http://x",
        ])
        .unwrap();
        assert_eq!(cli.file, PathBuf::from("urls.json"));
        assert!(matches!(cli.command, Command::Set { ref key, .. } if key == "abc"));
    }

    #[test]
    fn test_get_evict_expired_deletes_only_expired_entries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("urls.json");
        std::fs::write(
            &path,
            json!({
                "old": {"fulllink": "http://x", "expiry": "2000-01-01"},
                "live": {"fulllink": "http://y", "expiry": "2999-01-01"}
            })
            .to_string(),
        )
        .unwrap();

        // Without the flag an expired entry is left alone.
        assert_eq!(run_with(&path, &["get", "old"]).unwrap(), 0);
        assert!(on_disk(&path).get("old").is_some());

        assert_eq!(run_with(&path, &["get", "old", "--evict-expired"]).unwrap(), 0);
        assert_eq!(run_with(&path, &["get", "live", "--evict-expired"]).unwrap(), 0);
        assert_eq!(
            on_disk(&path),
            json!({"live": {"fulllink": "http://y", "expiry": "2999-01-01"}})
        );
    }

    #[test]
    fn test_set_writes_through_before_exit() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("urls.json");

        assert_eq!(
            run_with(&path, &["set", "abc", "--field", "fulllink=http://x"]).unwrap(),
            0
        );
        assert_eq!(on_disk(&path), json!({"abc": {"fulllink": "http://x"}}));
    }

    #[test]
    fn test_hold_times_out_and_flushes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("urls.json");
        std::fs::write(&path, r#"{"abc":{"fulllink":"http://x"}}"#).unwrap();

        assert_eq!(run_with(&path, &["hold", "--seconds", "1"]).unwrap(), 0);
        assert_eq!(on_disk(&path), json!({"abc": {"fulllink": "http://x"}}));
    }

    #[test]
    fn test_wrong_backend_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let json_file = tmp.path().join("urls.json");
        let err = run_with(&json_file, &["--table", "urls", "keys"]).unwrap_err();
        assert!(err.to_string().contains("--table"));
        assert!(!json_file.exists());

        let sqlite_file = tmp.path().join("urls.sqlite");
        assert!(run_with(&sqlite_file, &["hold", "--seconds", "1"]).is_err());
        assert!(run_with(&json_file, &["schema"]).is_err());
    }
}
