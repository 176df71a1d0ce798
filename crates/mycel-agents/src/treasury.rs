//! Treasury agent: token pools, staking positions, rewards.
//!
//! The treasury owns two record families, token pools (`pool-*` documents)
//! and staking positions (`pos-*` documents), and three pipelines:
//! `staking` activates and closes positions against pool supply, `reward`
//! accrues rewards on active positions, `distribution` settles accrued
//! rewards into pool metadata. Reward formulas beyond these contracts live
//! outside this core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use mycel_agent::{
    Agent, AgentContext, AgentError, ErrorKind, ErrorOutcome, LoopSpec, RecoveryAction,
};
use mycel_store_core::DocumentStore;
use mycel_types::AgentDescriptor;

use crate::parse_params;

//─────────────────────────────
//  Record models
//─────────────────────────────

/// Lifecycle status of a token pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Accepting stakes and distributions.
    Active,
    /// Suspended by `token_error` remediation or an operator.
    Suspended,
}

/// One token pool, exclusively owned by the treasury agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPool {
    /// Pool id (`pool-*`).
    pub id: String,
    /// Pool type (`rewards`, `grants`, `operations`, ...).
    pub pool_type: String,
    /// Total token supply allocated to the pool.
    pub total_supply: u64,
    /// Supply not currently locked in positions.
    pub available_supply: u64,
    /// Lifecycle status.
    pub status: PoolStatus,
    /// Open metadata (settlement totals, labels).
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a staking position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Created, waiting for the staking pipeline to lock supply.
    Pending,
    /// Supply locked; accruing rewards.
    Active,
    /// Closed; supply released.
    Closed,
    /// A transaction failure voided the position.
    Failed,
}

/// One staking position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakingPosition {
    /// Position id (`pos-*`).
    pub id: String,
    /// Staking member.
    pub member: String,
    /// Pool the stake is against.
    pub pool: String,
    /// Staked amount.
    pub amount: u64,
    /// Lifecycle status.
    pub status: PositionStatus,
    /// When the stake was requested.
    pub started_at: DateTime<Utc>,
    /// Optional maturity time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    /// Rewards accrued and not yet distributed.
    pub rewards_accrued: f64,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

//─────────────────────────────
//  Configuration and params
//─────────────────────────────

fn default_queue_capacity() -> usize {
    64
}

fn default_reward_rate() -> f64 {
    0.001
}

/// Builder configuration carried in the agent descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct TreasuryConfig {
    /// Capacity of each pipeline queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Reward fraction accrued per reward pass, per staked token.
    #[serde(default = "default_reward_rate")]
    pub reward_rate: f64,
}

impl Default for TreasuryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            reward_rate: default_reward_rate(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatePoolParams {
    pool_type: String,
    total_supply: u64,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StakeParams {
    member: String,
    pool: String,
    amount: u64,
    #[serde(default)]
    duration_days: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ListPositionsParams {
    #[serde(default)]
    pool: Option<String>,
    #[serde(default)]
    member: Option<String>,
}

//─────────────────────────────
//  Agent
//─────────────────────────────

/// The treasury agent.
pub struct TreasuryAgent {
    descriptor: AgentDescriptor,
    config: TreasuryConfig,
}

impl TreasuryAgent {
    /// Build the agent from its registration descriptor.
    pub fn from_descriptor(descriptor: &AgentDescriptor) -> Result<Self, String> {
        let config = if descriptor.config.is_null() {
            TreasuryConfig::default()
        } else {
            serde_json::from_value(descriptor.config.clone())
                .map_err(|err| format!("invalid treasury agent config: {err}"))?
        };
        Ok(Self { descriptor: descriptor.clone(), config })
    }

    async fn load_pool(&self, ctx: &AgentContext, id: &str) -> Result<TokenPool, AgentError> {
        let value = ctx
            .documents()
            .get(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        serde_json::from_value(value)
            .map_err(|err| AgentError::Internal(format!("corrupt pool '{id}': {err}")))
    }

    async fn load_position(
        &self,
        ctx: &AgentContext,
        id: &str,
    ) -> Result<StakingPosition, AgentError> {
        let value = ctx
            .documents()
            .get(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        serde_json::from_value(value)
            .map_err(|err| AgentError::Internal(format!("corrupt position '{id}': {err}")))
    }

    async fn persist<T: Serialize>(
        &self,
        ctx: &AgentContext,
        id: &str,
        record: &T,
    ) -> Result<(), AgentError> {
        let value =
            serde_json::to_value(record).map_err(|err| AgentError::Internal(err.to_string()))?;
        ctx.documents().put(id, &value).await?;
        Ok(())
    }

    async fn positions(
        &self,
        ctx: &AgentContext,
        pool: Option<&str>,
        member: Option<&str>,
    ) -> Result<Vec<StakingPosition>, AgentError> {
        let mut positions = Vec::new();
        for id in ctx.documents().list_ids().await? {
            if !id.starts_with("pos-") {
                continue;
            }
            let position = self.load_position(ctx, &id).await?;
            if pool.is_some_and(|p| p != position.pool) {
                continue;
            }
            if member.is_some_and(|m| m != position.member) {
                continue;
            }
            positions.push(position);
        }
        positions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(positions)
    }

    async fn set_pool_status(
        &self,
        ctx: &AgentContext,
        id: &str,
        status: PoolStatus,
        reason: Option<&str>,
    ) -> Result<TokenPool, AgentError> {
        let mut pool = self.load_pool(ctx, id).await?;
        pool.status = status;
        pool.updated_at = Utc::now();
        self.persist(ctx, &pool.id, &pool).await?;
        ctx.notify(
            match status {
                PoolStatus::Active => "pool.resumed",
                PoolStatus::Suspended => "pool.suspended",
            },
            id,
            json!({ "reason": reason }),
        );
        Ok(pool)
    }

    fn enqueue_task(
        &self,
        ctx: &AgentContext,
        queue_name: &str,
        task: serde_json::Value,
    ) -> Result<(), AgentError> {
        let queue = ctx
            .queue(queue_name)
            .ok_or_else(|| AgentError::Internal(format!("queue '{queue_name}' missing")))?;
        queue.enqueue(task).map_err(|(_, err)| AgentError::Queue(err))
    }

    /// One worker iteration over the named pipeline queue.
    async fn work(&self, pipeline: &str, ctx: &AgentContext) -> Result<(), AgentError> {
        let queue = match ctx.queue(pipeline) {
            Some(queue) => queue,
            None => return Ok(()),
        };
        let token = ctx.shutdown_token();
        // Wake periodically even when idle so the heartbeat stays fresh.
        let lease = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => return Ok(()),
            lease = queue.dequeue() => match lease {
                Some(lease) => lease,
                None => return Ok(()),
            },
        };

        // The lease stays in flight until processing settles.
        let result = match pipeline {
            "staking" => self.run_staking(ctx, lease.task()).await,
            "reward" => self.run_reward(ctx, lease.task()).await,
            "distribution" => self.run_distribution(ctx, lease.task()).await,
            other => Err(AgentError::Internal(format!("no worker for pipeline '{other}'"))),
        };
        lease.done();
        if result.is_ok() {
            ctx.runtime().metric_add(&format!("{pipeline}_completed"), 1.0);
        }
        result
    }

    async fn run_staking(
        &self,
        ctx: &AgentContext,
        task: &serde_json::Value,
    ) -> Result<(), AgentError> {
        let position_id = task
            .get("position_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::InvalidParams("staking task needs position_id".to_string()))?;
        let phase = task.get("phase").and_then(|v| v.as_str()).unwrap_or("activate");
        let mut position = self.load_position(ctx, position_id).await?;

        match phase {
            "activate" => {
                if position.status != PositionStatus::Pending {
                    debug!(position = position_id, "position already settled; skipping");
                    return Ok(());
                }
                let mut pool = self.load_pool(ctx, &position.pool).await?;
                if pool.status != PoolStatus::Active {
                    return Err(AgentError::Token {
                        subject: pool.id.clone(),
                        detail: "pool is not active".to_string(),
                    });
                }
                if pool.available_supply < position.amount {
                    return Err(AgentError::Transaction {
                        subject: position.id.clone(),
                        detail: format!(
                            "insufficient supply: {} < {}",
                            pool.available_supply, position.amount
                        ),
                    });
                }
                pool.available_supply -= position.amount;
                pool.updated_at = Utc::now();
                position.status = PositionStatus::Active;
                position.updated_at = Utc::now();
                self.persist(ctx, &pool.id, &pool).await?;
                self.persist(ctx, &position.id, &position).await?;
                ctx.notify("position.activated", &position.id, json!({ "pool": position.pool }));
            }
            "unstake" => {
                if position.status != PositionStatus::Active {
                    debug!(position = position_id, "position not active; skipping unstake");
                    return Ok(());
                }
                let mut pool = self.load_pool(ctx, &position.pool).await?;
                pool.available_supply =
                    (pool.available_supply + position.amount).min(pool.total_supply);
                pool.updated_at = Utc::now();
                position.status = PositionStatus::Closed;
                position.updated_at = Utc::now();
                self.persist(ctx, &pool.id, &pool).await?;
                self.persist(ctx, &position.id, &position).await?;
                ctx.notify("position.closed", &position.id, json!({ "pool": position.pool }));
            }
            other => {
                return Err(AgentError::InvalidParams(format!("unknown staking phase '{other}'")))
            }
        }
        Ok(())
    }

    async fn run_reward(
        &self,
        ctx: &AgentContext,
        task: &serde_json::Value,
    ) -> Result<(), AgentError> {
        let pool_filter = task.get("pool").and_then(|v| v.as_str());
        let mut accrued_total = 0.0;
        for mut position in self.positions(ctx, pool_filter, None).await? {
            if position.status != PositionStatus::Active {
                continue;
            }
            let accrued = position.amount as f64 * self.config.reward_rate;
            position.rewards_accrued += accrued;
            position.updated_at = Utc::now();
            self.persist(ctx, &position.id, &position).await?;
            accrued_total += accrued;
        }
        ctx.runtime().metric_add("rewards_accrued", accrued_total);
        debug!(accrued_total, "reward pass complete");
        Ok(())
    }

    async fn run_distribution(
        &self,
        ctx: &AgentContext,
        task: &serde_json::Value,
    ) -> Result<(), AgentError> {
        let pool_id = task
            .get("pool")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::InvalidParams("distribution task needs pool".to_string()))?;
        let mut pool = self.load_pool(ctx, pool_id).await?;
        if pool.status != PoolStatus::Active {
            return Err(AgentError::Token {
                subject: pool.id.clone(),
                detail: "cannot distribute from a suspended pool".to_string(),
            });
        }

        let mut distributed = 0.0;
        for mut position in self.positions(ctx, Some(pool_id), None).await? {
            if position.rewards_accrued <= 0.0 {
                continue;
            }
            distributed += position.rewards_accrued;
            position.rewards_accrued = 0.0;
            position.updated_at = Utc::now();
            self.persist(ctx, &position.id, &position).await?;
        }

        let previous = pool
            .metadata
            .get("distributed_total")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        if !pool.metadata.is_object() {
            pool.metadata = json!({});
        }
        if let Some(map) = pool.metadata.as_object_mut() {
            map.insert("distributed_total".to_string(), json!(previous + distributed));
            map.insert("last_distribution".to_string(), json!(Utc::now().to_rfc3339()));
        }
        pool.updated_at = Utc::now();
        self.persist(ctx, &pool.id, &pool).await?;
        ctx.notify("distribution.completed", pool_id, json!({ "amount": distributed }));
        Ok(())
    }
}

#[async_trait]
impl Agent for TreasuryAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn initialize(&self, ctx: &AgentContext) -> Result<(), AgentError> {
        for pipeline in ["staking", "reward", "distribution"] {
            if ctx.queue(pipeline).is_none() {
                ctx.register_queue(pipeline, self.config.queue_capacity)?;
            }
        }
        info!(agent = %ctx.id(), "treasury agent initialized");
        Ok(())
    }

    fn operations(&self) -> Vec<String> {
        [
            "create_pool",
            "get_pool",
            "list_pools",
            "suspend_pool",
            "resume_pool",
            "stake",
            "unstake",
            "accrue_rewards",
            "distribute",
            "list_positions",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    async fn handle(
        &self,
        operation: &str,
        params: serde_json::Value,
        ctx: &AgentContext,
    ) -> Result<serde_json::Value, AgentError> {
        match operation {
            "create_pool" => {
                let params: CreatePoolParams = parse_params(params)?;
                let now = Utc::now();
                let pool = TokenPool {
                    id: format!("pool-{}", uuid::Uuid::new_v4()),
                    pool_type: params.pool_type,
                    total_supply: params.total_supply,
                    available_supply: params.total_supply,
                    status: PoolStatus::Active,
                    metadata: params.metadata,
                    created_at: now,
                    updated_at: now,
                };
                self.persist(ctx, &pool.id, &pool).await?;
                ctx.notify("pool.created", &pool.id, json!({ "pool_type": pool.pool_type }));
                ctx.runtime().metric_add("pools_created", 1.0);
                Ok(serde_json::to_value(pool).unwrap_or_default())
            }
            "get_pool" => {
                let params: IdParams = parse_params(params)?;
                let pool = self.load_pool(ctx, &params.id).await?;
                Ok(serde_json::to_value(pool).unwrap_or_default())
            }
            "list_pools" => {
                let mut pools = Vec::new();
                for id in ctx.documents().list_ids().await? {
                    if id.starts_with("pool-") {
                        pools.push(serde_json::to_value(self.load_pool(ctx, &id).await?)
                            .unwrap_or_default());
                    }
                }
                Ok(json!({ "pools": pools, "count": pools.len() }))
            }
            "suspend_pool" => {
                let params: IdParams = parse_params(params)?;
                let pool =
                    self.set_pool_status(ctx, &params.id, PoolStatus::Suspended, Some("operator")).await?;
                Ok(serde_json::to_value(pool).unwrap_or_default())
            }
            "resume_pool" => {
                let params: IdParams = parse_params(params)?;
                let pool =
                    self.set_pool_status(ctx, &params.id, PoolStatus::Active, Some("operator")).await?;
                Ok(serde_json::to_value(pool).unwrap_or_default())
            }
            "stake" => {
                let params: StakeParams = parse_params(params)?;
                // Validate the pool before accepting the position.
                let pool = self.load_pool(ctx, &params.pool).await?;
                if pool.status != PoolStatus::Active {
                    return Err(AgentError::Token {
                        subject: pool.id,
                        detail: "pool is not accepting stakes".to_string(),
                    });
                }
                let now = Utc::now();
                let position = StakingPosition {
                    id: format!("pos-{}", uuid::Uuid::new_v4()),
                    member: params.member,
                    pool: params.pool,
                    amount: params.amount,
                    status: PositionStatus::Pending,
                    started_at: now,
                    ends_at: params
                        .duration_days
                        .map(|days| now + chrono::Duration::days(days as i64)),
                    rewards_accrued: 0.0,
                    updated_at: now,
                };
                self.persist(ctx, &position.id, &position).await?;
                self.enqueue_task(
                    ctx,
                    "staking",
                    json!({ "position_id": position.id, "phase": "activate" }),
                )?;
                ctx.notify("position.created", &position.id, json!({ "pool": position.pool }));
                Ok(serde_json::to_value(position).unwrap_or_default())
            }
            "unstake" => {
                let params: IdParams = parse_params(params)?;
                self.load_position(ctx, &params.id).await?;
                self.enqueue_task(
                    ctx,
                    "staking",
                    json!({ "position_id": params.id, "phase": "unstake" }),
                )?;
                Ok(json!({ "queued": true }))
            }
            "accrue_rewards" => {
                let pool = params.get("pool").and_then(|v| v.as_str()).map(str::to_string);
                self.enqueue_task(ctx, "reward", json!({ "pool": pool }))?;
                Ok(json!({ "queued": true }))
            }
            "distribute" => {
                let params: IdParams = parse_params(params)?;
                self.load_pool(ctx, &params.id).await?;
                self.enqueue_task(ctx, "distribution", json!({ "pool": params.id }))?;
                Ok(json!({ "queued": true }))
            }
            "list_positions" => {
                let params: ListPositionsParams = parse_params(params)?;
                let positions =
                    self.positions(ctx, params.pool.as_deref(), params.member.as_deref()).await?;
                Ok(json!({
                    "count": positions.len(),
                    "positions": positions
                        .into_iter()
                        .map(|p| serde_json::to_value(p).unwrap_or_default())
                        .collect::<Vec<_>>(),
                }))
            }
            other => Err(AgentError::UnknownOperation(other.to_string())),
        }
    }

    async fn handle_error(
        &self,
        kind: ErrorKind,
        data: serde_json::Value,
        ctx: &AgentContext,
    ) -> ErrorOutcome {
        match kind {
            ErrorKind::Token => {
                let Some(subject) = data.get("subject").and_then(|v| v.as_str()) else {
                    return ErrorOutcome::unknown_kind().with_detail("token_error without subject");
                };
                match self
                    .set_pool_status(ctx, subject, PoolStatus::Suspended, Some("token_error"))
                    .await
                {
                    Ok(_) => ErrorOutcome::handled(RecoveryAction::PoolSuspended).with_subject(subject),
                    Err(err) => ErrorOutcome {
                        success: false,
                        action: RecoveryAction::PoolSuspended,
                        subject: Some(subject.to_string()),
                        detail: Some(err.to_string()),
                    },
                }
            }
            ErrorKind::Transaction => {
                let Some(subject) = data.get("subject").and_then(|v| v.as_str()) else {
                    return ErrorOutcome::unknown_kind()
                        .with_detail("transaction_error without subject");
                };
                match self.load_position(ctx, subject).await {
                    Ok(mut position) => {
                        position.status = PositionStatus::Failed;
                        position.updated_at = Utc::now();
                        if let Err(err) = self.persist(ctx, &position.id, &position).await {
                            warn!(position = subject, error = %err, "could not persist failed position");
                            return ErrorOutcome {
                                success: false,
                                action: RecoveryAction::MarkedFailed,
                                subject: Some(subject.to_string()),
                                detail: Some(err.to_string()),
                            };
                        }
                        ctx.notify("position.failed", subject, json!({}));
                        ErrorOutcome::handled(RecoveryAction::MarkedFailed).with_subject(subject)
                    }
                    Err(err) => ErrorOutcome {
                        success: false,
                        action: RecoveryAction::MarkedFailed,
                        subject: Some(subject.to_string()),
                        detail: Some(err.to_string()),
                    },
                }
            }
            _ => ErrorOutcome::unknown_kind(),
        }
    }

    fn loops(&self) -> Vec<LoopSpec> {
        vec![
            LoopSpec::new("staking-worker"),
            LoopSpec::new("reward-worker"),
            LoopSpec::new("distribution-worker"),
        ]
    }

    async fn run_loop(&self, name: &str, ctx: &AgentContext) -> Result<(), AgentError> {
        match name {
            "staking-worker" => self.work("staking", ctx).await,
            "reward-worker" => self.work("reward", ctx).await,
            "distribution-worker" => self.work("distribution", ctx).await,
            other => Err(AgentError::Internal(format!("unknown loop '{other}'"))),
        }
    }
}
