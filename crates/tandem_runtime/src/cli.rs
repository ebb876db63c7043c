use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tandem_script::{Config, Context, HostFunction, HostValue};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Tandem - run scripts against an embedded QuickJS engine", long_about = None)]
pub struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Evaluate everything as strict code
    #[arg(long, global = true)]
    pub strict: bool,

    /// Root directory for dynamic `import()`
    #[arg(long, global = true)]
    pub module_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load script files into one context, in order
    Run {
        /// Script files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Evaluate a source string
    Eval {
        /// Script source
        source: String,
    },
}

impl Cli {
    /// Engine configuration: the file first, then command-line overrides.
    pub fn engine_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => Config::default(),
        };
        if self.strict {
            config.force_strict = true;
        }
        if let Some(root) = &self.module_path {
            config.module_path = Some(root.clone());
        }
        Ok(config)
    }

    /// Completion value of the last script run.
    pub fn execute(&self, ctx: &Context) -> Result<HostValue> {
        match &self.command {
            Commands::Run { files } => {
                let mut last = HostValue::Undefined;
                for file in files {
                    tracing::debug!(file = %file.display(), "running");
                    last = ctx
                        .load(file)
                        .with_context(|| format!("running {}", file.display()))?;
                }
                Ok(last)
            }
            Commands::Eval { source } => Ok(ctx.eval(source)?),
        }
    }
}

/// `print(...)`: arguments rendered and joined by spaces, to stdout.
pub fn print_function() -> HostFunction {
    HostFunction::variadic("print", |args| {
        let line: Vec<String> = args.iter().map(render).collect();
        println!("{}", line.join(" "));
        Ok(HostValue::Undefined)
    })
}

/// Human-readable form: strings as-is, plain data as JSON, references by
/// their type.
pub fn render(value: &HostValue) -> String {
    if let Some(text) = value.as_str() {
        return text.to_string();
    }
    if value.is_undefined() {
        return "undefined".to_string();
    }
    match value.to_json() {
        Ok(json) => json.to_string(),
        Err(_) => format!("[{}]", value.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["tandem", "--strict", "run", "a.js", "b.js"]).unwrap();
        assert!(cli.strict);
        match cli.command {
            Commands::Run { files } => assert_eq!(files.len(), 2),
            Commands::Eval { .. } => panic!("expected run"),
        }
        assert!(Cli::try_parse_from(["tandem", "run"]).is_err());
    }

    #[test]
    fn test_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "memory_limit": 1048576 }"#).unwrap();

        let config_arg = path.to_string_lossy().to_string();
        let cli = Cli::try_parse_from([
            "tandem",
            "--config",
            config_arg.as_str(),
            "--module-path",
            "/srv/js",
            "eval",
            "1",
        ])
        .unwrap();
        let config = cli.engine_config().unwrap();
        assert_eq!(config.memory_limit, Some(1_048_576));
        assert_eq!(config.module_path, Some(PathBuf::from("/srv/js")));
        assert!(!config.force_strict);
    }

    #[test]
    fn test_execute_run_returns_last_value() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.js");
        let second = dir.path().join("second.js");
        std::fs::write(&first, "var total = 40;").unwrap();
        std::fs::write(&second, "total + 2").unwrap();

        let cli = Cli::try_parse_from([
            "tandem".to_string(),
            "run".to_string(),
            first.to_string_lossy().to_string(),
            second.to_string_lossy().to_string(),
        ])
        .unwrap();
        let ctx = Context::new().unwrap();
        assert_eq!(cli.execute(&ctx).unwrap(), HostValue::Number(42.0));
    }

    #[test]
    fn test_render() {
        assert_eq!(render(&HostValue::from("plain")), "plain");
        assert_eq!(render(&HostValue::Undefined), "undefined");
        assert_eq!(render(&HostValue::from(vec![1, 2])), "[1.0,2.0]");
        assert_eq!(render(&HostValue::Function(print_function())), "[host function]");
    }
}
