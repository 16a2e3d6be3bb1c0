//! Line console for a running member
//!
//! One command per line:
//!
//! ```text
//! show                      all stocks
//! get <key>                 one stock
//! set <key> <value>         replicated set
//! remove <key>              replicated remove
//! cas <key> <expected> <new>
//! view                      current view and status
//! exit                      leave the group
//! ```

use crate::common::Result;
use crate::member::node::Member;
use crate::store::server::swapped;
use crate::transport::rpc::ResponseSet;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const HELP: &str =
    "commands: show | get <key> | set <key> <value> | remove <key> | cas <key> <expected> <new> | view | exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Show,
    Get(String),
    Set(String, f64),
    Remove(String),
    Cas {
        key: String,
        expected: f64,
        new: f64,
    },
    View,
    Exit,
}

impl Command {
    /// Parse one console line; `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = words.split_first() else {
            return Ok(None);
        };

        let command = match (name.to_ascii_lowercase().as_str(), args) {
            ("show", []) => Command::Show,
            ("get", [key]) => Command::Get(key.to_string()),
            ("set", [key, value]) => Command::Set(key.to_string(), parse_price(value)?),
            ("remove", [key]) => Command::Remove(key.to_string()),
            ("cas", [key, expected, new]) => Command::Cas {
                key: key.to_string(),
                expected: parse_price(expected)?,
                new: parse_price(new)?,
            },
            ("view", []) => Command::View,
            ("exit" | "x" | "quit", []) => Command::Exit,
            _ => return Err(format!("cannot parse '{}'; {}", line.trim(), HELP)),
        };
        Ok(Some(command))
    }
}

fn parse_price(s: &str) -> std::result::Result<f64, String> {
    s.parse::<f64>()
        .map_err(|_| format!("'{}' is not a number", s))
}

/// Read commands from `input` until `exit` or end of input.
///
/// Returns true if the user asked to exit.
pub async fn run<R, W>(member: &Member, input: R, mut output: W) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    output.write_all(format!("{}\n> ", HELP).as_bytes()).await?;
    output.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let reply = match Command::parse(&line) {
            Ok(None) => String::new(),
            Ok(Some(Command::Exit)) => return Ok(true),
            Ok(Some(command)) => execute(member, command).await,
            Err(message) => message,
        };
        if !reply.is_empty() {
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
        output.write_all(b"> ").await?;
        output.flush().await?;
    }
    Ok(false)
}

/// Run one command and render its outcome.
pub async fn execute(member: &Member, command: Command) -> String {
    let stocks = member.stocks();
    match command {
        Command::Show => match stocks.all() {
            Ok(all) if all.is_empty() => "no stocks".to_string(),
            Ok(all) => all
                .iter()
                .map(|(key, value)| format!("{}: {}", key, value))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("error: {}", e),
        },
        Command::Get(key) => match stocks.get(&key) {
            Ok(Some(value)) => format!("{}: {}", key, value),
            Ok(None) => format!("{}: not found", key),
            Err(e) => format!("error: {}", e),
        },
        Command::Set(key, value) => render(stocks.set(&key, value).await),
        Command::Remove(key) => render(stocks.remove(&key).await),
        Command::Cas { key, expected, new } => {
            match stocks.compare_and_swap(&key, expected, new).await {
                Ok(set) => {
                    let verdict = if swapped(&set) {
                        format!("changed {} from {} to {}", key, expected, new)
                    } else {
                        format!("failed changing {} from {} to {}", key, expected, new)
                    };
                    format!("{}\n{}", verdict, set.to_string().trim_end())
                }
                Err(e) => format!("error: {}", e),
            }
        }
        Command::View => {
            let view = member.view();
            format!("{} {}", member.status(), view)
        }
        Command::Exit => String::new(),
    }
}

fn render(result: Result<ResponseSet>) -> String {
    match result {
        Ok(set) => format!("responses:\n{}", set.to_string().trim_end()),
        Err(e) => format!("error: {}", e),
    }
}
