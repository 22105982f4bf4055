use std::time::Duration;

use queuekit::{Job, JobError, JobQueue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailJob {
    pub to: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfJob {
    pub document_id: String,
    #[serde(default = "default_pages")]
    pub pages: u32,
}

fn default_pages() -> u32 {
    1
}

// Demo handlers. Replace these with your real handlers.

pub fn register_email_handlers(queue: &JobQueue<EmailJob>) {
    queue.register_worker("sendWelcomeEmail", 5, send_welcome_email);
    queue.register_worker("sendNotification", 10, |job: Job<EmailJob>| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, JobError>(json!({ "notified": job.payload.to }))
    });
}

async fn send_welcome_email(job: Job<EmailJob>) -> Result<Value, JobError> {
    if !job.payload.to.contains('@') {
        return Err(JobError::new(format!(
            "invalid recipient address: {}",
            job.payload.to
        )));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(json!({
        "delivered_to": job.payload.to,
        "template": job.payload.template.unwrap_or_else(|| "welcome".to_string()),
        "attempt": job.attempts_made + 1,
    }))
}

pub fn register_pdf_handlers(queue: &JobQueue<PdfJob>) {
    let progress = queue.clone();
    queue.register_worker("generateDocument", 2, move |job: Job<PdfJob>| {
        let queue = progress.clone();
        async move {
            let pages = job.payload.pages.max(1);
            for page in 1..=pages {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let pct = percent_done(page, pages);
                // progress is best-effort
                if let Err(e) = queue.update_progress(job.id, pct).await {
                    tracing::debug!(job_id = job.id, error = %e, "progress update skipped");
                }
            }
            Ok::<_, JobError>(json!({
                "document_id": job.payload.document_id,
                "pages": pages,
            }))
        }
    });
}

fn percent_done(page: u32, pages: u32) -> u8 {
    (u64::from(page) * 100 / u64::from(pages.max(1))).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_holds_for_huge_documents() {
        assert_eq!(percent_done(1, 4), 25);
        assert_eq!(percent_done(4, 4), 100);
        assert_eq!(percent_done(50_000_000, 100_000_000), 50);
        assert_eq!(percent_done(u32::MAX, u32::MAX), 100);
    }
}
