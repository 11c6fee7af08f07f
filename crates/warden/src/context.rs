//! Facts gathered by the pipeline for the final upload

/// Placeholder for a fact the daemon could not gather.
const ABSENT: &str = "N/A";

/// Result context threaded through the pipeline.
///
/// Facts are only ever added. The final upload stage consumes the summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonContext {
    pub imei: Option<String>,
    pub phone: Option<String>,
    pub mac: Option<String>,
    pub db_cleaned: bool,
}

impl DaemonContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `IMEI:<v>|PHONE:<v>|MAC:<v>|DB:<0|1>`, absent facts rendered as `N/A`.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "IMEI:{}|PHONE:{}|MAC:{}|DB:{}",
            self.imei.as_deref().unwrap_or(ABSENT),
            self.phone.as_deref().unwrap_or(ABSENT),
            self.mac.as_deref().unwrap_or(ABSENT),
            u8::from(self.db_cleaned)
        )
    }
}
