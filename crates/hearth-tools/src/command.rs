use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use hearth_core::config::CommandToolConfig;
use hearth_core::error::{HearthError, Result};
use hearth_core::traits::Tool;
use hearth_core::types::{ToolContext, ToolResult};

const MAX_OUTPUT_BYTES: usize = 30_000;

/// A host shell command exposed as a tool.
///
/// `{{field}}` placeholders in the command line are replaced by the
/// shell-quoted value of the matching argument. The child process is killed
/// when the call is dropped, so a dispatcher timeout never leaves it running.
pub struct CommandTool {
    config: CommandToolConfig,
}

impl CommandTool {
    pub fn new(config: CommandToolConfig) -> Self {
        Self { config }
    }

    fn render_command(&self, args: &serde_json::Value) -> String {
        let template = &self.config.command;
        let mut out = String::with_capacity(template.len());
        let mut rest = template.as_str();

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let field = after[..end].trim();
                    let value = match args.get(field) {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(serde_json::Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    };
                    out.push_str(&shell_quote(&value));
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn truncate_output(mut s: String) -> String {
    if s.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("\n... (output truncated)");
    }
    s
}

impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        self.config
            .description
            .as_deref()
            .unwrap_or("Host command")
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.timeout_secs.map(Duration::from_secs)
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let command = self.render_command(&input);
            debug!(tool = %self.config.name, run_id = %ctx.run_id, command = %command, "Executing command tool");

            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .env("HEARTH_RUN_ID", &ctx.run_id.0)
                .env("HEARTH_CHAIN_ID", ctx.chain_id.to_string())
                .env("HEARTH_CALLER_GROUP", &ctx.caller.group)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| HearthError::ToolExecution {
                    tool: self.config.name.clone(),
                    message: e.to_string(),
                })?;

            let stdout = truncate_output(String::from_utf8_lossy(&output.stdout).trim().to_string());
            let stderr = truncate_output(String::from_utf8_lossy(&output.stderr).trim().to_string());

            if !output.status.success() {
                let code = output.status.code().unwrap_or(-1);
                let detail = if stderr.is_empty() { stdout } else { stderr };
                return Ok(ToolResult::error(format!("Exit code {}\n{}", code, detail)));
            }

            if self.config.parse_json {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&stdout) {
                    return Ok(ToolResult::success(value));
                }
            }
            Ok(ToolResult::success(stdout))
        })
    }
}
