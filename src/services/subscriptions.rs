//! Keeps the registered `channel.update` webhooks converged with the tracked
//! broadcasters.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::db::repository::BroadcasterRepository;
use crate::error::{with_timeout, AppResult};
use crate::services::twitch::{EventSubSubscription, SubscriptionPage};

const STATUS_ENABLED: &str = "enabled";

/// Subscription management calls the reconciler needs from Helix.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    async fn list_page(&self, cursor: Option<&str>) -> AppResult<SubscriptionPage>;

    /// Register a `channel.update` (v1) webhook for one broadcaster.
    async fn create(&self, broadcaster_user_id: &str, callback: &str, secret: &str)
        -> AppResult<()>;

    async fn delete(&self, subscription_id: &str) -> AppResult<()>;
}

/// Follow the pagination cursor until the last page.
pub async fn list_all_subscriptions(
    api: &dyn SubscriptionApi,
    timeout: Duration,
) -> AppResult<Vec<EventSubSubscription>> {
    let mut all = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = with_timeout(
            "list subscriptions",
            timeout,
            api.list_page(cursor.as_deref()),
        )
        .await?;
        all.extend(page.subscriptions);

        match page.cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(all),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Subscription ids to remove.
    pub delete: Vec<String>,
    /// Broadcaster twitch ids still lacking a subscription.
    pub create: Vec<String>,
}

/// Anything not enabled or for an untracked broadcaster goes; every tracked
/// broadcaster not covered by a kept subscription gets a new one.
pub fn plan(subscriptions: &[EventSubSubscription], desired: &HashSet<String>) -> ReconcilePlan {
    let mut missing: BTreeSet<&str> = desired.iter().map(String::as_str).collect();
    let mut delete = Vec::new();

    for sub in subscriptions {
        let tracked = sub.broadcaster_id().filter(|id| desired.contains(*id));
        match tracked {
            Some(id) if sub.status == STATUS_ENABLED => {
                missing.remove(id);
            }
            _ => delete.push(sub.id.clone()),
        }
    }

    ReconcilePlan {
        delete,
        create: missing.into_iter().map(str::to_string).collect(),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub deleted: usize,
    pub created: usize,
    pub failed: usize,
}

pub struct SubscriptionReconciler {
    api: Arc<dyn SubscriptionApi>,
    db: SqlitePool,
    callback_url: String,
    secret: String,
    timeout: Duration,
}

impl SubscriptionReconciler {
    pub fn new(
        api: Arc<dyn SubscriptionApi>,
        db: SqlitePool,
        callback_url: String,
        secret: String,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            db,
            callback_url,
            secret,
            timeout,
        }
    }

    /// One convergence pass. Listing failures abort the pass; per-item
    /// failures are counted and logged.
    pub async fn reconcile_once(&self) -> AppResult<ReconcileReport> {
        let subscriptions = list_all_subscriptions(self.api.as_ref(), self.timeout).await?;

        let broadcasters = with_timeout(
            "list broadcasters",
            self.timeout,
            BroadcasterRepository::list_all(&self.db),
        )
        .await?;
        let desired: HashSet<String> = broadcasters.into_iter().map(|b| b.twitch_id).collect();

        let plan = plan(&subscriptions, &desired);
        let mut report = ReconcileReport::default();

        for id in &plan.delete {
            match with_timeout("delete subscription", self.timeout, self.api.delete(id)).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    report.failed += 1;
                    error!("Failed to delete webhook {}: {}", id, e);
                }
            }
        }

        for twitch_id in &plan.create {
            let created = with_timeout(
                "create subscription",
                self.timeout,
                self.api.create(twitch_id, &self.callback_url, &self.secret),
            )
            .await;
            match created {
                Ok(()) => report.created += 1,
                Err(e) => {
                    report.failed += 1;
                    error!("Failed to create webhook for {}: {}", twitch_id, e);
                }
            }
        }

        Ok(report)
    }

    /// Reconcile now, then every `interval` until shutdown.
    pub async fn run(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        loop {
            match self.reconcile_once().await {
                Ok(report) => info!(
                    "EventSub reconciliation finished: deleted={}, created={}, failed={}",
                    report.deleted, report.created, report.failed
                ),
                Err(e) => warn!("EventSub reconciliation aborted: {}", e),
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("EventSub reconciler shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures;
    use crate::error::AppError;
    use crate::services::twitch::{EventSubCondition, EventSubTransport};
    use parking_lot::Mutex;

    fn sub(id: &str, broadcaster: &str, status: &str) -> EventSubSubscription {
        EventSubSubscription {
            id: id.to_string(),
            status: status.to_string(),
            subscription_type: "channel.update".to_string(),
            version: "1".to_string(),
            condition: EventSubCondition {
                broadcaster_user_id: Some(broadcaster.to_string()),
            },
            transport: EventSubTransport {
                method: "webhook".to_string(),
                callback: Some("https://example.invalid/webhook".to_string()),
                secret: None,
            },
        }
    }

    #[derive(Default)]
    struct FakeApi {
        pages: Vec<Vec<EventSubSubscription>>,
        subs: Mutex<Vec<EventSubSubscription>>,
        created: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        failing_creates: Mutex<usize>,
        fail_listing: bool,
    }

    #[async_trait]
    impl SubscriptionApi for FakeApi {
        async fn list_page(&self, cursor: Option<&str>) -> AppResult<SubscriptionPage> {
            if self.fail_listing {
                return Err(AppError::TwitchApi("listing down".to_string()));
            }
            if !self.pages.is_empty() {
                let idx: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
                let next = (idx + 1 < self.pages.len()).then(|| (idx + 1).to_string());
                return Ok(SubscriptionPage {
                    subscriptions: self.pages[idx].clone(),
                    cursor: next,
                });
            }
            Ok(SubscriptionPage {
                subscriptions: self.subs.lock().clone(),
                cursor: None,
            })
        }

        async fn create(&self, broadcaster: &str, _callback: &str, _secret: &str) -> AppResult<()> {
            let mut failing = self.failing_creates.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(AppError::TwitchApi("create failed".to_string()));
            }
            self.created.lock().push(broadcaster.to_string());
            let id = format!("sub-{}", broadcaster);
            self.subs.lock().push(sub(&id, broadcaster, STATUS_ENABLED));
            Ok(())
        }

        async fn delete(&self, subscription_id: &str) -> AppResult<()> {
            self.deleted.lock().push(subscription_id.to_string());
            self.subs.lock().retain(|s| s.id != subscription_id);
            Ok(())
        }
    }

    async fn reconciler(api: Arc<FakeApi>, twitch_ids: &[&str]) -> SubscriptionReconciler {
        let pool = fixtures::pool().await;
        for (i, id) in twitch_ids.iter().enumerate() {
            fixtures::broadcaster(&pool, id, &format!("user{}", i)).await;
        }
        SubscriptionReconciler::new(
            api,
            pool,
            "https://example.invalid/webhook".to_string(),
            "secret".to_string(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn plan_deletes_disabled_and_untracked() {
        let subs = vec![
            sub("a", "A", "enabled"),
            sub("b", "B", "enabled"),
            sub("c", "C", "webhook_callback_verification_failed"),
        ];
        let desired: HashSet<String> = ["A", "D"].iter().map(|s| s.to_string()).collect();

        assert_eq!(
            plan(&subs, &desired),
            ReconcilePlan {
                delete: vec!["b".to_string(), "c".to_string()],
                create: vec!["D".to_string()],
            }
        );
    }

    #[test]
    fn disabled_subscription_of_tracked_broadcaster_is_replaced() {
        let subs = vec![sub("a", "A", "authorization_revoked")];
        let desired: HashSet<String> = ["A".to_string()].into_iter().collect();

        let plan = plan(&subs, &desired);
        assert_eq!(plan.delete, vec!["a".to_string()]);
        assert_eq!(plan.create, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn reconcile_converges_example_set() {
        let api = Arc::new(FakeApi::default());
        *api.subs.lock() = vec![
            sub("a", "A", "enabled"),
            sub("b", "B", "enabled"),
            sub("c", "C", "disabled"),
        ];
        let reconciler = reconciler(api.clone(), &["A", "D"]).await;

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                deleted: 2,
                created: 1,
                failed: 0
            }
        );
        assert_eq!(*api.created.lock(), vec!["D".to_string()]);
        assert_eq!(*api.deleted.lock(), vec!["b".to_string(), "c".to_string()]);

        let second = reconciler.reconcile_once().await.unwrap();
        assert_eq!(second, ReconcileReport::default());
    }

    #[tokio::test]
    async fn failed_create_is_retried_next_pass() {
        let api = Arc::new(FakeApi::default());
        *api.failing_creates.lock() = 1;
        let reconciler = reconciler(api.clone(), &["A"]).await;

        let first = reconciler.reconcile_once().await.unwrap();
        assert_eq!(first.failed, 1);
        assert!(api.created.lock().is_empty());

        let second = reconciler.reconcile_once().await.unwrap();
        assert_eq!(second.created, 1);
        assert_eq!(*api.created.lock(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn listing_follows_every_page() {
        let api = FakeApi {
            pages: vec![
                vec![sub("a", "A", "enabled")],
                vec![sub("b", "B", "enabled")],
                vec![sub("c", "C", "enabled")],
            ],
            ..Default::default()
        };

        let all = list_all_subscriptions(&api, Duration::from_secs(5))
            .await
            .unwrap();
        let ids: Vec<&str> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn listing_failure_aborts_the_pass() {
        let api = Arc::new(FakeApi {
            fail_listing: true,
            ..Default::default()
        });
        let reconciler = reconciler(api.clone(), &["A"]).await;

        assert!(reconciler.reconcile_once().await.is_err());
        assert!(api.created.lock().is_empty());
    }
}
