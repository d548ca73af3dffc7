//! Music and trivia tasks.
//!
//! Availability is checked here, but the daily gate itself is enforced inside
//! the store's claim so concurrent submissions cannot both be paid.

use crate::auth::AuthContext;
use crate::database::task_repository::{
    MusicTask, RewardClaim, RewardOutcome, TaskKind, TaskStore, TriviaQuestion,
};
use crate::database::user_repository::{User, UserStore};
use crate::error::{AppError, AppResult, DomainError};
use crate::services::active_user;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListing {
    pub music: Vec<MusicTask>,
    pub trivia: Vec<TriviaQuestion>,
    pub trivia_available_today: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriviaAnswer {
    pub answer: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRewardResult {
    pub correct: bool,
    pub reward: BigDecimal,
    pub wallet_balance: BigDecimal,
}

pub struct TaskService {
    users: Arc<dyn UserStore>,
    tasks: Arc<dyn TaskStore>,
}

impl TaskService {
    pub fn new(users: Arc<dyn UserStore>, tasks: Arc<dyn TaskStore>) -> Self {
        Self { users, tasks }
    }

    /// Active content the caller's package gives access to
    pub async fn list_tasks(&self, ctx: &AuthContext) -> AppResult<TaskListing> {
        let user = active_user(self.users.as_ref(), ctx.user_id).await?;
        let now = Utc::now();
        let (music, trivia) = futures::try_join!(
            self.tasks.list_active_music_tasks(),
            self.tasks.list_active_trivia_questions(),
        )?;

        Ok(TaskListing {
            music: music
                .into_iter()
                .filter(|t| package_allows(&user, t.package_id, now))
                .collect(),
            trivia: trivia
                .into_iter()
                .filter(|q| package_allows(&user, q.package_id, now))
                .collect(),
            trivia_available_today: !answered_on(&user, now.date_naive()),
        })
    }

    pub async fn complete_music(
        &self,
        ctx: &AuthContext,
        task_id: Uuid,
    ) -> AppResult<TaskRewardResult> {
        let user = active_user(self.users.as_ref(), ctx.user_id).await?;
        let task = self
            .tasks
            .find_music_task(task_id)
            .await?
            .ok_or_else(|| task_not_found(task_id))?;
        let now = Utc::now();
        ensure_available(&user, task_id, task.is_active, task.package_id, now)?;

        let claim = RewardClaim {
            user_id: user.id,
            task_id,
            kind: TaskKind::Music,
            reward: task.reward.clone(),
            today: now.date_naive(),
            description: format!("Music task: {}", task.title),
        };
        let wallet_balance = self.claim(claim, "music").await?;
        Ok(TaskRewardResult {
            correct: true,
            reward: task.reward,
            wallet_balance,
        })
    }

    /// A wrong answer is reported without using up the day's attempt
    pub async fn answer_trivia(
        &self,
        ctx: &AuthContext,
        question_id: Uuid,
        answer: &str,
    ) -> AppResult<TaskRewardResult> {
        let user = active_user(self.users.as_ref(), ctx.user_id).await?;
        let question = self
            .tasks
            .find_trivia_question(question_id)
            .await?
            .ok_or_else(|| task_not_found(question_id))?;
        let now = Utc::now();
        ensure_available(&user, question_id, question.is_active, question.package_id, now)?;

        if answered_on(&user, now.date_naive()) {
            return Err(daily_limit("trivia"));
        }

        if !question.is_correct(answer) {
            debug!(user_id = %user.id, question_id = %question_id, "incorrect trivia answer");
            return Ok(TaskRewardResult {
                correct: false,
                reward: BigDecimal::from(0),
                wallet_balance: user.wallet_balance,
            });
        }

        let claim = RewardClaim {
            user_id: user.id,
            task_id: question_id,
            kind: TaskKind::Trivia,
            reward: question.reward.clone(),
            today: now.date_naive(),
            description: "Daily trivia".to_string(),
        };
        let wallet_balance = self.claim(claim, "trivia").await?;
        Ok(TaskRewardResult {
            correct: true,
            reward: question.reward,
            wallet_balance,
        })
    }

    async fn claim(&self, claim: RewardClaim, activity: &str) -> AppResult<BigDecimal> {
        let user_id = claim.user_id;
        let task_id = claim.task_id;
        match self.tasks.claim_task_reward(claim).await? {
            RewardOutcome::Granted {
                wallet_balance,
                transaction,
            } => {
                crate::log_transaction!(
                    event = "task_reward",
                    transaction_id = transaction.id,
                    user_id = user_id,
                    task_id = task_id,
                    activity = activity,
                    amount = transaction.amount,
                );
                Ok(wallet_balance)
            }
            RewardOutcome::AlreadyClaimed => Err(daily_limit(activity)),
            RewardOutcome::UserNotFound => Err(AppError::domain(DomainError::UserNotFound {
                user_id: user_id.to_string(),
            })),
        }
    }
}

fn answered_on(user: &User, today: NaiveDate) -> bool {
    user.last_trivia_task_date.is_some_and(|last| last >= today)
}

fn package_allows(user: &User, package_id: Option<Uuid>, now: DateTime<Utc>) -> bool {
    package_id.map_or(true, |required| user.has_active_package(required, now))
}

fn ensure_available(
    user: &User,
    task_id: Uuid,
    is_active: bool,
    package_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let reason = if !is_active {
        "task is not active"
    } else if !package_allows(user, package_id, now) {
        "requires an active package"
    } else {
        return Ok(());
    };
    Err(AppError::domain(DomainError::TaskNotAvailable {
        task_id: task_id.to_string(),
        reason: reason.to_string(),
    }))
}

fn task_not_found(task_id: Uuid) -> AppError {
    AppError::domain(DomainError::TaskNotFound {
        task_id: task_id.to_string(),
    })
}

fn daily_limit(activity: &str) -> AppError {
    AppError::domain(DomainError::DailyLimitReached {
        activity: activity.to_string(),
    })
}
