use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use holder::{CancellationToken, Host, HostConfig, Request, WorkerFlags};

struct Args {
    import: String,
    method: Option<String>,
    args: Vec<serde_json::Value>,
    timeout: Option<Duration>,
    transform_types: bool,
    node: Option<PathBuf>,
}

fn usage() {
    eprintln!(
        "Usage: holder <import> [--method NAME] [--arg JSON]... [--timeout MS] [--transform-types] [--node PATH]"
    );
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <import>             Module to load in the worker (path or specifier)");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --method <name>      Export to call [default: default]");
    eprintln!("  --arg <json>         Argument as JSON; repeat for more arguments");
    eprintln!("  --timeout <ms>       Give up on the call after this many milliseconds");
    eprintln!("  --transform-types    Let the worker import TypeScript modules");
    eprintln!("  --node <path>        Node.js binary [default: $HOLDER_NODE or node]");
    eprintln!("  --version            Print version and exit");
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();

    let args = match parse_args(&argv) {
        Ok(Some(args)) => args,
        Ok(None) => {
            println!("holder {}", holder::HOLDER_VERSION);
            return;
        }
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    holder::logging::init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// `Ok(None)` means `--version` was requested.
fn parse_args(argv: &[String]) -> Result<Option<Args>, String> {
    let mut import: Option<String> = None;
    let mut args = Args {
        import: String::new(),
        method: None,
        args: Vec::new(),
        timeout: None,
        transform_types: false,
        node: None,
    };

    let mut i = 1; // skip argv[0]
    while i < argv.len() {
        match argv[i].as_str() {
            "--method" => {
                i += 1;
                args.method = Some(argv.get(i).ok_or("--method requires a value")?.clone());
            }
            "--arg" => {
                i += 1;
                let raw = argv.get(i).ok_or("--arg requires a value")?;
                let value = serde_json::from_str(raw)
                    .map_err(|e| format!("--arg {raw:?} is not valid JSON: {e}"))?;
                args.args.push(value);
            }
            "--timeout" => {
                i += 1;
                let raw = argv.get(i).ok_or("--timeout requires a value")?;
                let ms: u64 = raw
                    .parse()
                    .map_err(|_| format!("--timeout expects milliseconds, got {raw:?}"))?;
                args.timeout = Some(Duration::from_millis(ms));
            }
            "--node" => {
                i += 1;
                args.node = Some(PathBuf::from(argv.get(i).ok_or("--node requires a value")?));
            }
            "--transform-types" => args.transform_types = true,
            "--version" | "-V" => return Ok(None),
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => {
                if import.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                import = Some(arg.to_string());
            }
        }
        i += 1;
    }

    args.import = import.ok_or("missing required argument: <import>")?;
    Ok(Some(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = HostConfig::from_env()?.with_flags(WorkerFlags {
        disable_experimental_warning: true,
        transform_types: args.transform_types,
    });
    if let Some(node) = args.node {
        config = config.with_program(node);
    }

    let outer = CancellationToken::new();
    let host = Host::spawn(config, outer.clone()).context("starting worker")?;
    tracing::debug!(pid = ?host.pid(), "Worker running");

    let ctrl_c = {
        let outer = outer.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, shutting down worker");
                outer.cancel();
            }
        })
    };

    let mut request = Request::new(args.import).args(args.args);
    if let Some(method) = args.method {
        request = request.method(method);
    }

    let result = match args.timeout {
        Some(timeout) => host.call_timeout(request, timeout).await,
        None => host.call(request, &CancellationToken::new()).await,
    };

    // Shut the worker down whether or not the call succeeded.
    if let Err(e) = host.stop().await {
        tracing::debug!(error = %e, "Worker already gone at stop");
    }
    let exit = host.wait().await;
    ctrl_c.abort();

    let payload = result.context("call failed")?;
    let json = serde_json::to_string_pretty(&payload.into_value())?;
    println!("{json}");

    exit.context("worker did not exit cleanly")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("holder")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_full_invocation() {
        let args = parse_args(&argv(&[
            "./m.js",
            "--method",
            "inc",
            "--arg",
            "5",
            "--arg",
            r#"{"a":1}"#,
            "--timeout",
            "250",
            "--transform-types",
            "--node",
            "/opt/node",
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(args.import, "./m.js");
        assert_eq!(args.method.as_deref(), Some("inc"));
        assert_eq!(args.args, vec![serde_json::json!(5), serde_json::json!({"a": 1})]);
        assert_eq!(args.timeout, Some(Duration::from_millis(250)));
        assert!(args.transform_types);
        assert_eq!(args.node, Some(PathBuf::from("/opt/node")));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&argv(&[])).is_err());
        assert!(parse_args(&argv(&["a.js", "b.js"])).is_err());
        assert!(parse_args(&argv(&["a.js", "--arg", "{nope"])).is_err());
        assert!(parse_args(&argv(&["a.js", "--timeout", "soon"])).is_err());
        assert!(parse_args(&argv(&["a.js", "--bogus"])).is_err());
        assert!(parse_args(&argv(&["a.js", "--method"])).is_err());
    }

    #[test]
    fn version_flag() {
        assert!(parse_args(&argv(&["--version"])).unwrap().is_none());
    }
}
