use clap::{Parser, Subcommand};
use dialoguer::Password;
use dirs::home_dir;
use gridctl::config::{ensure_parent, DEFAULT_CONFIG_YAML};
use gridctl::{AuthScheme, Config, ExecutionError, GridClient, GridError, GridSettings, ProcessExecutor};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const ICOMMANDS: [&str; 9] = [
    "iinit", "ipwd", "ils", "iput", "irm", "imkdir", "ilocate", "irepl", "imeta",
];

#[derive(Parser, Debug)]
#[command(name = "gridctl", version, about = "Grid filesystem client")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    /// Run the command on behalf of this user.
    #[arg(long = "as", global = true)]
    as_user: Option<String>,
    /// How to impersonate `--as`: gsi (default) or credentials.
    #[arg(long, global = true)]
    as_scheme: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Log in as the configured admin and verify the connection.
    Init {
        #[arg(long)]
        prompt_password: bool,
    },
    Whoami,
    Pwd,
    Ls {
        path: Option<String>,
        #[arg(short = 'l', long)]
        long: bool,
    },
    Put {
        path: String,
        destination: Option<String>,
    },
    Rm {
        path: String,
        #[arg(short = 'r', long)]
        recursive: bool,
        #[arg(short = 'f', long)]
        force: bool,
    },
    Search {
        pattern: String,
        #[arg(long)]
        exact: bool,
    },
    Repl {
        object: String,
        #[arg(short = 'n', long, default_value_t = 1)]
        replicas: u32,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        dest: Option<String>,
    },
    Replicas {
        object: String,
    },
    Check {
        path: String,
    },
    Mkdir {
        path: String,
        #[arg(short = 'p', long)]
        parents: bool,
    },
    Touch {
        path: String,
    },
    Locate {
        path: String,
    },
    Meta {
        #[command(subcommand)]
        command: MetaCommand,
    },
    Doctor,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Subcommand, Debug)]
enum MetaCommand {
    Ls {
        path: String,
    },
    Set {
        path: String,
        attribute: String,
        value: String,
    },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ExecutionError>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
    as_user: Option<String>,
    as_scheme: Option<String>,
}

fn main() -> Result<(), GridError> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let ctx = build_context(&cli);

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Init { prompt_password } => handle_init(&ctx, prompt_password),
        Commands::Whoami => handle_whoami(&ctx),
        Commands::Pwd => handle_pwd(&ctx),
        Commands::Ls { path, long } => handle_ls(&ctx, path, long),
        Commands::Put { path, destination } => handle_put(&ctx, path, destination),
        Commands::Rm {
            path,
            recursive,
            force,
        } => handle_rm(&ctx, path, recursive, force),
        Commands::Search { pattern, exact } => handle_search(&ctx, pattern, exact),
        Commands::Repl {
            object,
            replicas,
            source,
            dest,
        } => handle_repl(&ctx, object, replicas, source, dest),
        Commands::Replicas { object } => handle_replicas(&ctx, object),
        Commands::Check { path } => handle_check(&ctx, path),
        Commands::Mkdir { path, parents } => handle_mkdir(&ctx, path, true, parents),
        Commands::Touch { path } => handle_mkdir(&ctx, path, false, false),
        Commands::Locate { path } => handle_locate(&ctx, path),
        Commands::Meta { command } => handle_meta(&ctx, command),
        Commands::Doctor => handle_doctor(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.execution_details().cloned(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
        as_user: cli.as_user.clone(),
        as_scheme: cli.as_scheme.clone(),
    }
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    let from_env = |key: &str| env::var_os(key).filter(|value| !value.is_empty()).map(PathBuf::from);
    override_path
        .cloned()
        .or_else(|| from_env("GRIDCTL_CONFIG"))
        .unwrap_or_else(|| {
            from_env("GRIDCTL_CONFIG_DIR")
                .unwrap_or_else(|| {
                    home_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join(".config")
                        .join("gridctl")
                })
                .join("config.yaml")
        })
}

fn load_config(ctx: &Context) -> Result<Config, GridError> {
    Config::load(&ctx.config_path)?.with_process_env()
}

fn load_settings(ctx: &Context, prompt_password: bool) -> Result<GridSettings, GridError> {
    let mut settings = load_config(ctx)?.settings()?;
    let needs_password = matches!(settings.scheme, AuthScheme::Credentials | AuthScheme::Pam);
    if prompt_password && needs_password && settings.password.is_none() {
        if !io::stdin().is_terminal() {
            return Err(GridError::Configuration(
                "--prompt-password needs an interactive terminal".to_string(),
            ));
        }
        let password = Password::new()
            .with_prompt(format!("Grid password for {}", settings.user))
            .interact()?;
        settings.password = Some(password);
    }
    Ok(settings)
}

fn connect(ctx: &Context, prompt_password: bool) -> Result<GridClient, GridError> {
    let settings = load_settings(ctx, prompt_password)?;
    let mut client = GridClient::connect(settings)?;
    if let Some(user) = ctx.as_user.as_deref() {
        let scheme = match ctx.as_scheme.as_deref() {
            Some(raw) => raw.parse::<AuthScheme>()?,
            None => AuthScheme::Gsi,
        };
        client.become_user_with(user, scheme)?;
    }
    Ok(client)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), GridError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let cfg = Config::read(&ctx.config_path)?.with_process_env()?;
            let missing = cfg.settings().err().map(|err| err.to_string());
            output(
                ctx,
                json!({"path": ctx.config_path, "valid": true, "complete": missing.is_none(), "missing": missing}),
            )
        }
        ConfigCommand::Show => {
            let mut cfg = load_config(ctx)?;
            if !cfg.password.is_empty() {
                cfg.password = "<redacted>".to_string();
            }
            if ctx.json {
                return output(ctx, serde_json::to_value(&cfg)?);
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
    }
}

fn handle_init(ctx: &Context, prompt_password: bool) -> Result<(), GridError> {
    let client = connect(ctx, prompt_password)?;
    let entries = client.verify_connection()?;
    let settings = client.settings();
    output(
        ctx,
        json!({
            "user": settings.user,
            "host": settings.host,
            "port": settings.port,
            "zone": settings.zone,
            "scheme": settings.scheme,
            "session_file": settings.session_file,
            "entries": entries.len(),
        }),
    )
}

fn handle_whoami(ctx: &Context) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    let session = client.session();
    output(
        ctx,
        json!({
            "user": client.whoami(),
            "state": format!("{:?}", client.state()),
            "session": session,
            "scheme": session.map(|env| env.scheme()),
        }),
    )
}

fn handle_pwd(ctx: &Context) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    let dir = client.base_dir()?;
    output_lines(ctx, json!({"path": dir}), &[dir.clone()])
}

fn handle_ls(ctx: &Context, path: Option<String>, long: bool) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    let records = client.list(path.as_deref(), long)?;
    let lines: Vec<String> = records.iter().map(|record| record.fields.join(" ")).collect();
    output_lines(ctx, json!({"entries": records}), &lines)
}

fn handle_put(ctx: &Context, path: String, destination: Option<String>) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    client.save(&path, destination.as_deref())?;
    output(ctx, json!({"uploaded": path, "destination": destination}))
}

fn handle_rm(ctx: &Context, path: String, recursive: bool, force: bool) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    client.remove(&path, recursive, force)?;
    output(ctx, json!({"removed": path}))
}

fn handle_search(ctx: &Context, pattern: String, exact: bool) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    let found = client.search(&pattern, !exact)?;
    output_lines(ctx, json!({"matches": found}), &found)
}

fn handle_repl(
    ctx: &Context,
    object: String,
    replicas: u32,
    source: Option<String>,
    dest: Option<String>,
) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    client.replica(&object, replicas, source.as_deref(), dest.as_deref())?;
    let resources = client.replica_list(&object)?;
    output(ctx, json!({"object": object, "resources": resources}))
}

fn handle_replicas(ctx: &Context, object: String) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    let resources = client.replica_list(&object)?;
    output_lines(ctx, json!({"object": object, "resources": resources}), &resources)
}

fn handle_check(ctx: &Context, path: String) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    let exists = client.check(&path)?;
    output(ctx, json!({"path": path, "exists": exists}))
}

fn handle_mkdir(ctx: &Context, path: String, directory: bool, parents: bool) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    client.create_empty(&path, directory, parents)?;
    output(ctx, json!({"created": path}))
}

fn handle_locate(ctx: &Context, path: String) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    let url = client.current_location(&path);
    output_lines(ctx, json!({"url": url}), &[url.clone()])
}

fn handle_meta(ctx: &Context, command: MetaCommand) -> Result<(), GridError> {
    let client = connect(ctx, false)?;
    match command {
        MetaCommand::Ls { path } => {
            let metas = client.meta_list(&path)?;
            let lines: Vec<String> = metas
                .iter()
                .map(|(attribute, value)| format!("{attribute}: {value}"))
                .collect();
            output_lines(ctx, json!({"path": path, "metadata": metas}), &lines)
        }
        MetaCommand::Set {
            path,
            attribute,
            value,
        } => {
            client.meta_write(&path, &attribute, &value)?;
            output(ctx, json!({"path": path, "attribute": attribute, "value": value}))
        }
    }
}

fn handle_doctor(ctx: &Context) -> Result<(), GridError> {
    let cfg = load_config(ctx)?;
    let settings = cfg.settings();
    let bin_dir = settings.as_ref().ok().and_then(|s| s.bin_dir.clone());
    let executor = ProcessExecutor::new(bin_dir);

    let mut checks = BTreeMap::new();
    for program in ICOMMANDS {
        checks.insert(program.to_string(), executor.resolve(program).is_ok());
    }
    let config_ok = settings.is_ok();
    checks.insert("config".to_string(), config_ok);

    let missing: Vec<&String> = checks
        .iter()
        .filter(|(_, ok)| !**ok)
        .map(|(name, _)| name)
        .collect();
    let ok = missing.is_empty();
    let error = if ok {
        None
    } else {
        Some(format!(
            "doctor found problems: {}",
            missing
                .iter()
                .map(|name| name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    };

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            error: error.clone(),
            error_details: None,
        };
        print_json(&payload)?;
    } else {
        for (name, passed) in &checks {
            println!("{name}: {}", if *passed { "ok" } else { "missing" });
        }
    }
    match error {
        Some(message) if !ctx.json => Err(GridError::Configuration(message)),
        Some(_) => std::process::exit(1),
        None => Ok(()),
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), GridError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        return print_json(&wrapper);
    }
    match payload {
        serde_json::Value::Object(fields) => {
            for (key, value) in fields {
                println!("{key}: {}", plain(&value));
            }
        }
        other => println!("{}", plain(&other)),
    }
    Ok(())
}

fn plain(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

fn output_lines(ctx: &Context, payload: serde_json::Value, lines: &[String]) -> Result<(), GridError> {
    if ctx.json {
        return output(ctx, payload);
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), GridError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
