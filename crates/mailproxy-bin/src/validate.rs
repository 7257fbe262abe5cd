use std::path::PathBuf;

use mailproxy::{
    CONFIG,
    service::entitlements::{EntitlementSource, FileEntitlementSource},
};

/// Load the mailbox access file and print what it grants.
pub(crate) async fn validate_config(file: Option<PathBuf>) -> anyhow::Result<()> {
    let source =
        FileEntitlementSource::new(file.unwrap_or_else(|| CONFIG.mailbox_access_file.clone()));
    let table = source.load().await?;

    println!(
        "Mailbox access file `{}` is valid: {} application(s)",
        source.path().display(),
        table.application_count()
    );
    let mut applications: Vec<_> = table.iter().collect();
    applications.sort_by_key(|(app_id, _)| app_id.to_string());
    for (app_id, mailboxes) in applications {
        println!("  {app_id}: {} mailbox(es)", mailboxes.len());
    }

    if CONFIG.openid.is_none() {
        println!("Warning: no OpenID provider configured, `serve` will refuse to start");
    }
    Ok(())
}
