//! Directive parsing.
//!
//! Input starting with `/` is a directive. Arguments are split with
//! shell-style quoting, so `/mcp add docs stdio npx -y "my server"` keeps the
//! quoted argument intact.

use crate::config::{McpServerConfig, McpTransport};
use thiserror::Error;

/// A parsed `/` directive.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Help,
    Clear,
    /// `None` shows the active model
    Model(Option<String>),
    McpAdd {
        name: String,
        config: McpServerConfig,
    },
    McpRemove(String),
    McpList,
    McpTools(Option<String>),
    Status,
    Exit,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("not a directive")]
    NotADirective,

    #[error("unbalanced quotes")]
    Unbalanced,

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("unknown transport '{0}' (expected stdio, sse or http)")]
    UnknownTransport(String),
}

const MCP_USAGE: &str = "/mcp add <name> stdio <command> [args...] | /mcp remove <name> | /mcp list | /mcp tools [server]";
const MCP_ADD_USAGE: &str = "/mcp add <name> stdio <command> [args...]";
const MCP_REMOVE_USAGE: &str = "/mcp remove <name>";

pub const HELP_TEXT: &str = "\
Commands:
  /help                              Show this help
  /clear                             Clear the conversation history
  /model [name]                      Show or switch the active model
  /mcp add <name> stdio <cmd> [args] Connect a tool server
  /mcp remove <name>                 Disconnect a tool server
  /mcp list                          List connected tool servers
  /mcp tools [server]                List available tools
  /status                            Show session status
  /exit                              End the session";

/// Whether `input` should be handled as a directive.
pub fn is_directive(input: &str) -> bool {
    input.trim_start().starts_with('/')
}

pub fn parse(input: &str) -> Result<Directive, DirectiveError> {
    let input = input.trim();
    let Some(body) = input.strip_prefix('/') else {
        return Err(DirectiveError::NotADirective);
    };
    let words = shlex::split(body).ok_or(DirectiveError::Unbalanced)?;
    let Some((head, rest)) = words.split_first() else {
        return Ok(Directive::Unknown(input.to_string()));
    };

    let directive = match head.to_ascii_lowercase().as_str() {
        "help" | "?" => Directive::Help,
        "clear" => Directive::Clear,
        "model" => Directive::Model(rest.first().cloned()),
        "status" => Directive::Status,
        "exit" | "quit" | "q" => Directive::Exit,
        "mcp" => parse_mcp(rest)?,
        _ => Directive::Unknown(input.to_string()),
    };
    Ok(directive)
}

fn parse_mcp(args: &[String]) -> Result<Directive, DirectiveError> {
    let Some((sub, rest)) = args.split_first() else {
        return Err(DirectiveError::Usage(MCP_USAGE));
    };
    match sub.as_str() {
        "list" | "ls" => Ok(Directive::McpList),
        "tools" => Ok(Directive::McpTools(rest.first().cloned())),
        "remove" | "rm" => match rest {
            [name] => Ok(Directive::McpRemove(name.clone())),
            _ => Err(DirectiveError::Usage(MCP_REMOVE_USAGE)),
        },
        "add" => {
            let [name, transport, target, extra @ ..] = rest else {
                return Err(DirectiveError::Usage(MCP_ADD_USAGE));
            };
            let transport: McpTransport = transport
                .parse()
                .map_err(|_| DirectiveError::UnknownTransport(transport.clone()))?;
            let config = match transport {
                McpTransport::Stdio => {
                    let mut command = vec![target.clone()];
                    command.extend(extra.iter().cloned());
                    McpServerConfig::stdio(command)
                }
                remote => McpServerConfig::remote(remote, target.clone()),
            };
            Ok(Directive::McpAdd {
                name: name.clone(),
                config,
            })
        }
        _ => Err(DirectiveError::Usage(MCP_USAGE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_directives() {
        assert_eq!(parse("/help").unwrap(), Directive::Help);
        assert_eq!(parse("  /clear ").unwrap(), Directive::Clear);
        assert_eq!(parse("/status").unwrap(), Directive::Status);
        assert_eq!(parse("/q").unwrap(), Directive::Exit);
        assert_eq!(parse("/QUIT").unwrap(), Directive::Exit);
    }

    #[test]
    fn model_with_and_without_name() {
        assert_eq!(parse("/model").unwrap(), Directive::Model(None));
        assert_eq!(
            parse("/model gpt-4").unwrap(),
            Directive::Model(Some("gpt-4".into()))
        );
    }

    #[test]
    fn mcp_add_stdio_keeps_quoted_args() {
        let directive = parse(r#"/mcp add docs stdio npx -y "@acme/docs server""#).unwrap();
        let Directive::McpAdd { name, config } = directive else {
            panic!("expected McpAdd");
        };
        assert_eq!(name, "docs");
        assert_eq!(config.transport, McpTransport::Stdio);
        assert_eq!(config.command, vec!["npx", "-y", "@acme/docs server"]);
    }

    #[test]
    fn mcp_add_remote_uses_url() {
        let Directive::McpAdd { config, .. } =
            parse("/mcp add api http http://localhost:9000/mcp").unwrap()
        else {
            panic!("expected McpAdd");
        };
        assert_eq!(config.transport, McpTransport::Http);
        assert_eq!(config.url.as_deref(), Some("http://localhost:9000/mcp"));
    }

    #[test]
    fn mcp_subcommands() {
        assert_eq!(parse("/mcp list").unwrap(), Directive::McpList);
        assert_eq!(parse("/mcp tools").unwrap(), Directive::McpTools(None));
        assert_eq!(
            parse("/mcp tools git").unwrap(),
            Directive::McpTools(Some("git".into()))
        );
        assert_eq!(
            parse("/mcp remove git").unwrap(),
            Directive::McpRemove("git".into())
        );
    }

    #[test]
    fn malformed_input() {
        assert_eq!(parse("hello"), Err(DirectiveError::NotADirective));
        assert_eq!(parse("/mcp add \"oops"), Err(DirectiveError::Unbalanced));
        assert_eq!(parse("/mcp"), Err(DirectiveError::Usage(MCP_USAGE)));
        assert_eq!(parse("/mcp add x"), Err(DirectiveError::Usage(MCP_ADD_USAGE)));
        assert!(matches!(
            parse("/mcp add x carrier-pigeon coo"),
            Err(DirectiveError::UnknownTransport(_))
        ));
    }

    #[test]
    fn unknown_directives_are_kept_verbatim() {
        assert_eq!(
            parse("/frobnicate now").unwrap(),
            Directive::Unknown("/frobnicate now".into())
        );
        assert_eq!(parse("/").unwrap(), Directive::Unknown("/".into()));
    }

    #[test]
    fn detects_directives() {
        assert!(is_directive("/help"));
        assert!(is_directive("  /model x"));
        assert!(!is_directive("list files in /tmp"));
    }
}
