//! Route tracing output through a channel into the editor's status area;
//! the terminal itself belongs to the raw-mode UI.

/// Writer that forwards formatted log lines to a channel.
struct ChannelWriter {
    sender: tokio::sync::mpsc::UnboundedSender<String>,
}

impl std::io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf).trim_end().to_string();
        if !line.is_empty() {
            let _ = self.sender.send(line);
        }
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Install the subscriber; the receiver feeds the UI log line.
pub fn install() -> tokio::sync::mpsc::UnboundedReceiver<String> {
    gg::send_logs_to_tracing(gg::LogOptions::default().with_logs_enabled(true));

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .without_time()
        .with_file(false)
        .with_line_number(false)
        .with_target(false)
        .with_writer(move || ChannelWriter { sender: tx.clone() })
        .try_init();

    rx
}
