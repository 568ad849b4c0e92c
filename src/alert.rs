//! Audit alert system
//!
//! Pipeline failures (persistence exhausted, tampering, unauthorized access,
//! key trouble) become `AuditAlert`s. What happens for each trigger is a
//! fixed playbook row; severity only decides how far up the escalation chain
//! the alert goes and whether it goes there immediately. Every step the
//! system takes for an alert is kept in that alert's trail.

use crate::error::{AuditError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What raised the alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerKind {
    PersistenceFailure,
    TamperingDetected,
    UnauthorizedAdminAccess,
    EncryptionFailure,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PersistenceFailure => "persistence_failure",
            Self::TamperingDetected => "tampering_detected",
            Self::UnauthorizedAdminAccess => "unauthorized_admin_access",
            Self::EncryptionFailure => "encryption_failure",
        }
    }

    /// Fixed response tuple for this trigger
    pub fn playbook(&self) -> &'static Playbook {
        // PLAYBOOKS has one row per variant, in declaration order
        &PLAYBOOKS[*self as usize]
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Escalation level, 1 (first responder only) to 4 (whole chain)
    pub fn escalation_level(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    pub fn is_immediate(&self) -> bool {
        *self >= Self::High
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseAction {
    ImmediateNotification,
    ActivateBackupPath,
    CreateIncident,
    NotifySecurityTeam,
    AccessReview,
    Lockdown,
    ForensicCapture,
    KeyReview,
}

impl ResponseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImmediateNotification => "immediate_notification",
            Self::ActivateBackupPath => "activate_backup_path",
            Self::CreateIncident => "create_incident",
            Self::NotifySecurityTeam => "notify_security_team",
            Self::AccessReview => "access_review",
            Self::Lockdown => "lockdown",
            Self::ForensicCapture => "forensic_capture",
            Self::KeyReview => "key_review",
        }
    }
}

/// Who gets pulled in at each escalation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Responder {
    OnCallEngineer,
    PlatformLead,
    SecurityTeam,
    ComplianceOfficer,
    IncidentCommander,
    Ciso,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationChannel {
    Pager,
    Email,
    Chat,
    SecurityHotline,
}

impl NotificationChannel {
    pub const ALL: [NotificationChannel; 4] = [
        NotificationChannel::Pager,
        NotificationChannel::Email,
        NotificationChannel::Chat,
        NotificationChannel::SecurityHotline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pager => "pager",
            Self::Email => "email",
            Self::Chat => "chat",
            Self::SecurityHotline => "security_hotline",
        }
    }
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{responseActions, escalationSteps, notificationChannels}` for one trigger
#[derive(Debug)]
pub struct Playbook {
    pub trigger: TriggerKind,
    pub response_actions: &'static [ResponseAction],
    pub escalation_steps: &'static [Responder],
    pub notification_channels: &'static [NotificationChannel],
}

static PLAYBOOKS: [Playbook; 4] = [
    Playbook {
        trigger: TriggerKind::PersistenceFailure,
        response_actions: &[
            ResponseAction::ImmediateNotification,
            ResponseAction::ActivateBackupPath,
            ResponseAction::CreateIncident,
        ],
        escalation_steps: &[
            Responder::OnCallEngineer,
            Responder::PlatformLead,
            Responder::IncidentCommander,
        ],
        notification_channels: &[NotificationChannel::Pager, NotificationChannel::Chat],
    },
    Playbook {
        trigger: TriggerKind::TamperingDetected,
        response_actions: &[
            ResponseAction::Lockdown,
            ResponseAction::ForensicCapture,
            ResponseAction::CreateIncident,
        ],
        escalation_steps: &[
            Responder::SecurityTeam,
            Responder::ComplianceOfficer,
            Responder::IncidentCommander,
            Responder::Ciso,
        ],
        notification_channels: &[
            NotificationChannel::Pager,
            NotificationChannel::SecurityHotline,
            NotificationChannel::Email,
        ],
    },
    Playbook {
        trigger: TriggerKind::UnauthorizedAdminAccess,
        response_actions: &[
            ResponseAction::NotifySecurityTeam,
            ResponseAction::AccessReview,
        ],
        escalation_steps: &[Responder::SecurityTeam, Responder::ComplianceOfficer],
        notification_channels: &[
            NotificationChannel::SecurityHotline,
            NotificationChannel::Email,
        ],
    },
    Playbook {
        trigger: TriggerKind::EncryptionFailure,
        response_actions: &[
            ResponseAction::ImmediateNotification,
            ResponseAction::KeyReview,
        ],
        escalation_steps: &[Responder::OnCallEngineer, Responder::SecurityTeam],
        notification_channels: &[NotificationChannel::Pager, NotificationChannel::Email],
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub level: u8,
    pub immediate: bool,
    /// Responders in the order they are engaged
    pub steps: Vec<Responder>,
}

impl Escalation {
    fn for_alert(playbook: &Playbook, severity: Severity) -> Self {
        let level = severity.escalation_level();
        Self {
            level,
            immediate: severity.is_immediate(),
            steps: playbook
                .escalation_steps
                .iter()
                .take(usize::from(level))
                .copied()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditAlert {
    /// Unique alert ID (`alert-<uuid>`)
    pub id: String,
    pub trigger: TriggerKind,
    pub severity: Severity,
    pub response_actions: Vec<ResponseAction>,
    pub escalation: Escalation,
    pub notification_channels: Vec<NotificationChannel>,
    /// Free-form context, e.g. the audit IDs involved
    #[serde(default)]
    pub detail: String,
    pub raised_at: DateTime<Utc>,
}

impl AuditAlert {
    pub fn new(trigger: TriggerKind, severity: Severity, detail: impl Into<String>) -> Self {
        let playbook = trigger.playbook();
        Self {
            id: format!("alert-{}", uuid::Uuid::new_v4()),
            trigger,
            severity,
            response_actions: playbook.response_actions.to_vec(),
            escalation: Escalation::for_alert(playbook, severity),
            notification_channels: playbook.notification_channels.to_vec(),
            detail: detail.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn get_escalation(&self) -> &Escalation {
        &self.escalation
    }
}

/// One step the alert system took for an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AlertTrailEntry {
    Triggered {
        at: DateTime<Utc>,
        severity: Severity,
    },
    ResponseTaken {
        at: DateTime<Utc>,
        action: ResponseAction,
    },
    Escalated {
        at: DateTime<Utc>,
        responder: Responder,
        immediate: bool,
    },
    NotificationSent {
        at: DateTime<Utc>,
        channel: NotificationChannel,
    },
    NotificationFailed {
        at: DateTime<Utc>,
        channel: NotificationChannel,
        reason: String,
    },
    Acknowledged {
        at: DateTime<Utc>,
        actor: String,
    },
}

/// Delivery target for one notification channel
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    fn channel(&self) -> NotificationChannel;

    async fn notify(&self, alert: &AuditAlert) -> Result<()>;
}

/// Notifier that emits a structured log event and nothing else
pub struct TracingNotifier {
    channel: NotificationChannel,
}

impl TracingNotifier {
    pub fn new(channel: NotificationChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl AlertNotifier for TracingNotifier {
    fn channel(&self) -> NotificationChannel {
        self.channel
    }

    async fn notify(&self, alert: &AuditAlert) -> Result<()> {
        tracing::warn!(
            channel = %self.channel,
            alert_id = %alert.id,
            trigger = %alert.trigger,
            severity = %alert.severity,
            detail = %alert.detail,
            "Audit alert notification"
        );
        Ok(())
    }
}

struct AlertState {
    alert: AuditAlert,
    trail: Vec<AlertTrailEntry>,
    acknowledged: bool,
}

/// Alert dispatcher and alert history
///
/// History is capped at `max_alerts`. Past the cap the oldest acknowledged
/// alert is evicted first; the oldest open alert goes only when none are
/// acknowledged.
pub struct AlertSystem {
    alerts: RwLock<Vec<AlertState>>,
    notifiers: HashMap<NotificationChannel, Arc<dyn AlertNotifier>>,
    max_alerts: usize,
}

impl Default for AlertSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertSystem {
    /// Alert system with a `TracingNotifier` on every channel
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Keep at most `max_alerts` alerts in history
    pub fn with_capacity(max_alerts: usize) -> Self {
        let notifiers = NotificationChannel::ALL
            .iter()
            .map(|&channel| {
                let notifier: Arc<dyn AlertNotifier> = Arc::new(TracingNotifier::new(channel));
                (channel, notifier)
            })
            .collect();

        Self {
            alerts: RwLock::new(Vec::new()),
            notifiers,
            max_alerts: max_alerts.max(1),
        }
    }

    /// Route a channel to a different notifier
    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifiers.insert(notifier.channel(), notifier);
        self
    }

    pub async fn trigger_alert(&self, trigger: TriggerKind, severity: Severity) -> AuditAlert {
        self.trigger_with_detail(trigger, severity, "").await
    }

    /// Raise an alert, run its playbook, and record every step taken
    ///
    /// Notification failures are recorded in the trail; they never stop the
    /// remaining channels or the alert itself.
    pub async fn trigger_with_detail(
        &self,
        trigger: TriggerKind,
        severity: Severity,
        detail: impl Into<String>,
    ) -> AuditAlert {
        let alert = AuditAlert::new(trigger, severity, detail);

        if severity >= Severity::High {
            tracing::error!(
                alert_id = %alert.id,
                trigger = %trigger,
                severity = %severity,
                detail = %alert.detail,
                "Audit alert raised"
            );
        } else {
            tracing::warn!(
                alert_id = %alert.id,
                trigger = %trigger,
                severity = %severity,
                detail = %alert.detail,
                "Audit alert raised"
            );
        }

        let mut trail = vec![AlertTrailEntry::Triggered {
            at: alert.raised_at,
            severity,
        }];

        for &action in &alert.response_actions {
            tracing::info!(alert_id = %alert.id, action = action.as_str(), "Alert response action taken");
            trail.push(AlertTrailEntry::ResponseTaken {
                at: Utc::now(),
                action,
            });
        }

        for &responder in &alert.escalation.steps {
            trail.push(AlertTrailEntry::Escalated {
                at: Utc::now(),
                responder,
                immediate: alert.escalation.immediate,
            });
        }

        for &channel in &alert.notification_channels {
            trail.push(self.deliver(&alert, channel).await);
        }

        let mut alerts = self.alerts.write().await;
        alerts.push(AlertState {
            alert: alert.clone(),
            trail,
            acknowledged: false,
        });
        self.evict(&mut alerts);

        alert
    }

    fn evict(&self, alerts: &mut Vec<AlertState>) {
        while alerts.len() > self.max_alerts {
            let index = match alerts.iter().position(|s| s.acknowledged) {
                Some(index) => index,
                None => {
                    tracing::warn!(
                        alert_id = %alerts[0].alert.id,
                        max_alerts = self.max_alerts,
                        "Alert history full, evicting oldest open alert"
                    );
                    0
                }
            };
            let evicted = alerts.remove(index);
            tracing::debug!(alert_id = %evicted.alert.id, "Alert evicted from history");
        }
    }

    /// Number of alerts kept in history
    pub async fn len(&self) -> usize {
        self.alerts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.alerts.read().await.is_empty()
    }

    async fn deliver(&self, alert: &AuditAlert, channel: NotificationChannel) -> AlertTrailEntry {
        let result = match self.notifiers.get(&channel) {
            Some(notifier) => notifier.notify(alert).await,
            None => Err(AuditError::Notification {
                channel: channel.to_string(),
                reason: "no notifier registered".to_string(),
            }),
        };

        match result {
            Ok(()) => AlertTrailEntry::NotificationSent {
                at: Utc::now(),
                channel,
            },
            Err(e) => {
                tracing::error!(
                    alert_id = %alert.id,
                    channel = %channel,
                    error = %e,
                    "Alert notification failed"
                );
                AlertTrailEntry::NotificationFailed {
                    at: Utc::now(),
                    channel,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Ordered history of what was done for an alert
    pub async fn get_alert_audit_trail(&self, alert_id: &str) -> Result<Vec<AlertTrailEntry>> {
        let alerts = self.alerts.read().await;
        alerts
            .iter()
            .find(|s| s.alert.id == alert_id)
            .map(|s| s.trail.clone())
            .ok_or_else(|| AuditError::NotFound(format!("Alert not found: {}", alert_id)))
    }

    /// Record that a responder has taken ownership of an alert
    pub async fn acknowledge(&self, alert_id: &str, actor: &str) -> Result<()> {
        let mut alerts = self.alerts.write().await;
        let state = alerts
            .iter_mut()
            .find(|s| s.alert.id == alert_id)
            .ok_or_else(|| AuditError::NotFound(format!("Alert not found: {}", alert_id)))?;

        if state.acknowledged {
            return Err(AuditError::validation(
                "alert_id",
                format!("alert {} already acknowledged", alert_id),
            ));
        }

        state.acknowledged = true;
        state.trail.push(AlertTrailEntry::Acknowledged {
            at: Utc::now(),
            actor: actor.to_string(),
        });
        tracing::info!(alert_id = %alert_id, actor = %actor, "Audit alert acknowledged");
        Ok(())
    }

    /// Every alert raised so far, oldest first
    pub async fn list_alerts(&self) -> Vec<AuditAlert> {
        self.alerts
            .read()
            .await
            .iter()
            .map(|s| s.alert.clone())
            .collect()
    }

    /// Alerts nobody has acknowledged yet
    pub async fn open_alerts(&self) -> Vec<AuditAlert> {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|s| !s.acknowledged)
            .map(|s| s.alert.clone())
            .collect()
    }
}
