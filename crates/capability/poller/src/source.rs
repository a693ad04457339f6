//! 硬件源接口与 upsc 实现。
//!
//! NUT 链路协议本身由外部协作方负责；这里只通过窄查询接口
//! （连接 / 断开 / 拉取全部变量）消费它。

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::warn;

/// 硬件源错误。
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source unreachable: {0}")]
    Unreachable(String),
    #[error("query failed: {0}")]
    Query(String),
}

/// 硬件遥测源的窄查询接口。
#[async_trait]
pub trait UpsSource: Send {
    async fn connect(&mut self) -> Result<(), SourceError>;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// 拉取全部变量（变量名 → 文本值）。
    async fn fetch_variables(&mut self) -> Result<BTreeMap<String, String>, SourceError>;
}

/// 通过外部 `upsc` 工具查询 NUT 守护进程的实现。
pub struct UpscCommandSource {
    ups_name: String,
    connected: bool,
}

impl UpscCommandSource {
    /// `ups_name` 允许 `upsname@host` 形式；查询时取 `@` 之前的部分。
    pub fn new(ups_name: impl Into<String>) -> Self {
        Self {
            ups_name: ups_name.into(),
            connected: false,
        }
    }

    fn target(&self) -> &str {
        match self.ups_name.find('@') {
            Some(at) => &self.ups_name[..at],
            None => &self.ups_name,
        }
    }

    async fn run_upsc(&self) -> Result<BTreeMap<String, String>, SourceError> {
        let output = tokio::process::Command::new("upsc")
            .arg(self.target())
            .output()
            .await
            .map_err(|err| SourceError::Unreachable(err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::Query(stderr.trim().to_string()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_upsc_output(&stdout))
    }
}

#[async_trait]
impl UpsSource for UpscCommandSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        if self.connected {
            return Ok(());
        }
        // 探测式连接：一次成功查询即视为链路可用
        let variables = self.run_upsc().await?;
        if variables.is_empty() {
            return Err(SourceError::Query("no variables returned".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn fetch_variables(&mut self) -> Result<BTreeMap<String, String>, SourceError> {
        if !self.connected {
            return Err(SourceError::Unreachable("not connected".to_string()));
        }
        match self.run_upsc().await {
            Ok(variables) => Ok(variables),
            Err(err) => {
                // 查询失败视为链路断开，交回轮询循环做退避重连
                warn!(target: "upslink.poller", error = %err, "source_query_failed");
                self.connected = false;
                Err(err)
            }
        }
    }
}

/// 解析 upsc 输出：每行 `variable.name: value`。
fn parse_upsc_output(output: &str) -> BTreeMap<String, String> {
    let mut variables = BTreeMap::new();
    for line in output.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if !name.is_empty() && !value.is_empty() {
            variables.insert(name.to_string(), value.to_string());
        }
    }
    variables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsc_output_parses_name_value_lines() {
        let output = "battery.charge: 100\nups.status: OL\nmalformed line\nempty.value:\n";
        let variables = parse_upsc_output(output);
        assert_eq!(variables.get("battery.charge").map(String::as_str), Some("100"));
        assert_eq!(variables.get("ups.status").map(String::as_str), Some("OL"));
        assert_eq!(variables.len(), 2);
    }

    #[test]
    fn ups_name_host_suffix_is_stripped() {
        let source = UpscCommandSource::new("apc_bx@localhost");
        assert_eq!(source.target(), "apc_bx");
        let plain = UpscCommandSource::new("apc_bx");
        assert_eq!(plain.target(), "apc_bx");
    }
}
