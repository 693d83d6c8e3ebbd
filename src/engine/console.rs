//! Console code page maintenance on Windows hosts

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::host::{HostError, ProcessInvoker, ProcessRequest};

pub const CODE_PAGE_TIMEOUT: Duration = Duration::from_secs(5);

const UTF8_CODE_PAGE: &str = "65001";

/// Switch the console to UTF-8 so child output decodes correctly.
/// A no-op on other platforms.
pub async fn switch_to_utf8(timeout: Duration) -> Result<(), HostError> {
    if !cfg!(windows) {
        return Ok(());
    }

    let mut request = ProcessRequest::new("chcp.com", "").arg(UTF8_CODE_PAGE);
    request.kill_on_cancel = true;
    let token = CancellationToken::new();
    let invoker = ProcessInvoker::new();

    match tokio::time::timeout(timeout, invoker.execute(&request, None, &token)).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(HostError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("chcp {} did not finish within {:?}", UTF8_CODE_PAGE, timeout),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_noop_off_windows() {
        tokio_test::assert_ok!(switch_to_utf8(Duration::from_millis(1)).await);
    }
}
