//! A toy interpreter to attach to with `telerepl`.
//!
//! * `!<command>` runs a shell command
//! * `:edit <path> [line]` edits a file with the operator's editor
//! * `:page <path>` shows a file
//! * anything else is echoed back, with a word count on the evaluator's stdout

use std::path::Path;

use telerepl::host::{serve, Evaluator, HostConfig, Session};

#[derive(Default)]
struct Toy {
    evaluated: usize,
}

impl Toy {
    async fn eval_line(&mut self, session: &Session, line: &str) -> telerepl::Result<()> {
        let _unit = session.unit();
        self.evaluated += 1;

        if let Some(command) = line.strip_prefix('!') {
            session.system(command).await?;
        } else if let Some(args) = line.strip_prefix(":edit ") {
            let mut args = args.split_whitespace();
            let path = args.next().unwrap_or("scratch.txt");
            let at = args.next().and_then(|at| at.parse().ok()).unwrap_or(1);
            session.edit_file(Path::new(path), at).await?;
        } else if let Some(path) = line.strip_prefix(":page ") {
            let text = std::fs::read_to_string(path.trim())?;
            session.page(&text).await?;
        } else {
            session.output().puts(line).await?;
            session
                .stdout()
                .print(&format!("{} word(s)\n", line.split_whitespace().count()))
                .await?;
        }
        Ok(())
    }
}

impl Evaluator for Toy {
    async fn evaluate(&mut self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        session.output().puts("toy REPL, end with EOF").await?;
        loop {
            let prompt = format!("toy[{}]> ", self.evaluated);
            let Some(line) = session.input().readline(&prompt).await? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            if let Err(e) = self.eval_line(session, &line).await {
                if e.is_connection() {
                    return Err(e.into());
                }
                session.output().puts(&format!("error: {e}")).await?;
            }
        }
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
    {
        eprintln!("Failed to initialize tracing: {e}");
    }

    let toy = serve(Toy::default(), HostConfig::default())?;
    eprintln!("{} line(s) evaluated", toy.evaluated);

    Ok(())
}
