use aligner_training::config::{default_config_root, UnknownKeyPolicy, CONFIG_ROOT_ENV};
use clap::{CommandFactory, Parser, ValueEnum};
use std::path::PathBuf;

/// Train a multimodal cost model.
///
/// Every key of the default configuration document can be overridden with a
/// trailing `--<dotted.key> <value>` pair, e.g. `--train_cfgs.epochs 3`.
#[derive(Parser, Debug)]
#[command(
    name = "train-cost-model",
    author,
    version,
    about = "Train a text + image cost model",
    after_help = "Any other `--<dotted.key> <value>` pair overrides the default configuration."
)]
pub struct Args {
    /// Directory holding `<mode>/<task>.yaml` defaults and `deepspeed/` documents
    #[arg(long, env = CONFIG_ROOT_ENV, default_value_os_t = default_config_root())]
    pub config_root: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// How overrides for keys absent from the defaults are treated
    #[arg(long, value_enum, default_value_t = UnknownKeys::Tolerate)]
    pub unknown_keys: UnknownKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UnknownKeys {
    Tolerate,
    Reject,
}

impl From<UnknownKeys> for UnknownKeyPolicy {
    fn from(value: UnknownKeys) -> Self {
        match value {
            UnknownKeys::Tolerate => Self::Tolerate,
            UnknownKeys::Reject => Self::Reject,
        }
    }
}

/// Splits `argv` into the tokens clap owns and the trailing override pairs.
///
/// A token belongs to clap when its long or short name is declared on
/// [`Args`]; everything else is left for `parse_overrides`.
pub fn split_args(argv: &[String]) -> (Vec<String>, Vec<String>) {
    let command = Args::command();
    let mut known = Vec::new();
    let mut overrides = Vec::new();

    let mut tokens = argv.iter();
    if let Some(program) = tokens.next() {
        known.push(program.clone());
    }

    while let Some(token) = tokens.next() {
        let arg = if let Some(flag) = token.strip_prefix("--") {
            let name = flag.split_once('=').map_or(flag, |(name, _)| name);
            if matches!(name, "help" | "version") {
                known.push(token.clone());
                continue;
            }
            command.get_arguments().find(|a| a.get_long() == Some(name)).map(|a| (a, flag.contains('=')))
        } else if let Some(short) = short_flag(token) {
            if matches!(short, 'h' | 'V') {
                known.push(token.clone());
                continue;
            }
            command.get_arguments().find(|a| a.get_short() == Some(short)).map(|a| (a, false))
        } else {
            None
        };

        match arg {
            Some((arg, inline_value)) => {
                known.push(token.clone());
                if arg.get_action().takes_values() && !inline_value {
                    if let Some(value) = tokens.next() {
                        known.push(value.clone());
                    }
                }
            }
            None => {
                overrides.push(token.clone());
                // the value of an override flag may itself look like a flag (`--lr -1`)
                if token.starts_with("--") && !token.contains('=') {
                    if let Some(value) = tokens.next() {
                        overrides.push(value.clone());
                    }
                }
            }
        }
    }

    (known, overrides)
}

fn short_flag(token: &str) -> Option<char> {
    let mut chars = token.strip_prefix('-')?.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c != '-' => Some(c),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("train-cost-model").chain(args.iter().copied()).map(String::from).collect()
    }

    #[test]
    fn test_known_flags_are_separated_from_overrides() {
        let (known, overrides) = split_args(&argv(&[
            "--train_cfgs.seed",
            "7",
            "--config-root",
            "/etc/aligner",
            "--model_cfgs.model_max_length=256",
            "-l",
            "debug",
        ]));

        assert_eq!(known, argv(&["--config-root", "/etc/aligner", "-l", "debug"]));
        assert_eq!(overrides, vec!["--train_cfgs.seed", "7", "--model_cfgs.model_max_length=256"]);
    }

    #[test]
    fn test_inline_known_value() {
        let (known, overrides) = split_args(&argv(&["--log-level=warn", "--unknown-keys", "reject"]));
        assert_eq!(known, argv(&["--log-level=warn", "--unknown-keys", "reject"]));
        assert!(overrides.is_empty());

        let args = Args::parse_from(known);
        assert_eq!(args.log_level, "warn");
        assert_eq!(UnknownKeyPolicy::from(args.unknown_keys), UnknownKeyPolicy::Reject);
    }

    #[test]
    fn test_override_value_that_looks_like_a_flag() {
        let (known, overrides) = split_args(&argv(&["--train_cfgs.adam_beta1", "-1"]));
        assert_eq!(known, argv(&[]));
        assert_eq!(overrides, vec!["--train_cfgs.adam_beta1", "-1"]);
    }

    #[test]
    fn test_args_definition_is_valid() {
        Args::command().debug_assert();
    }
}
