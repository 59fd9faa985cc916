use clap::ValueEnum;

/// How download events are shown.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum EventFormat {
    /// Progress bar on the terminal
    Bar,
    /// One JSON object per event on stdout
    Json,
}

pub fn parse_batch_size(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("batch size must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}
