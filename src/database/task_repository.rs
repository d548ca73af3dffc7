use crate::database::error::DatabaseError;
use crate::database::transaction_repository::{
    insert_ledger_entry, NewTransaction, Transaction, TransactionType,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Music,
    Trivia,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Music => "music",
            TaskKind::Trivia => "trivia",
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MusicTask {
    pub id: Uuid,
    pub title: String,
    pub artist: String,
    pub audio_url: String,
    pub duration_seconds: i32,
    pub reward: BigDecimal,
    pub is_active: bool,
    pub package_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TriviaQuestion {
    pub id: Uuid,
    pub question: String,
    pub options: Json<Vec<String>>,
    #[serde(skip_serializing)]
    pub correct_answer: String,
    pub reward: BigDecimal,
    pub is_active: bool,
    pub package_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TriviaQuestion {
    /// Case- and whitespace-insensitive comparison
    pub fn is_correct(&self, answer: &str) -> bool {
        self.correct_answer.trim().eq_ignore_ascii_case(answer.trim())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMusicTask {
    pub title: String,
    pub artist: String,
    pub audio_url: String,
    pub duration_seconds: i32,
    pub reward: BigDecimal,
    #[serde(default)]
    pub package_id: Option<Uuid>,
}

impl NewMusicTask {
    pub fn into_task(self) -> MusicTask {
        MusicTask {
            id: Uuid::new_v4(),
            title: self.title,
            artist: self.artist,
            audio_url: self.audio_url,
            duration_seconds: self.duration_seconds,
            reward: self.reward,
            is_active: true,
            package_id: self.package_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTriviaQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: String,
    pub reward: BigDecimal,
    #[serde(default)]
    pub package_id: Option<Uuid>,
}

impl NewTriviaQuestion {
    pub fn into_question(self) -> TriviaQuestion {
        TriviaQuestion {
            id: Uuid::new_v4(),
            question: self.question,
            options: Json(self.options),
            correct_answer: self.correct_answer,
            reward: self.reward,
            is_active: true,
            package_id: self.package_id,
            created_at: Utc::now(),
        }
    }
}

/// A reward grant guarded by the task's daily gate
#[derive(Debug, Clone)]
pub struct RewardClaim {
    pub user_id: Uuid,
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub reward: BigDecimal,
    pub today: NaiveDate,
    pub description: String,
}

#[derive(Debug, Clone)]
pub enum RewardOutcome {
    Granted {
        wallet_balance: BigDecimal,
        transaction: Transaction,
    },
    AlreadyClaimed,
    UserNotFound,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TaskCounts {
    pub active_music_tasks: i64,
    pub active_trivia_questions: i64,
    pub music_completions_today: i64,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn find_music_task(&self, id: Uuid) -> Result<Option<MusicTask>, DatabaseError>;

    async fn find_trivia_question(&self, id: Uuid)
        -> Result<Option<TriviaQuestion>, DatabaseError>;

    async fn list_active_music_tasks(&self) -> Result<Vec<MusicTask>, DatabaseError>;

    async fn list_active_trivia_questions(&self) -> Result<Vec<TriviaQuestion>, DatabaseError>;

    async fn insert_music_task(&self, new: NewMusicTask) -> Result<MusicTask, DatabaseError>;

    async fn insert_trivia_question(
        &self,
        new: NewTriviaQuestion,
    ) -> Result<TriviaQuestion, DatabaseError>;

    /// Returns false when no such task exists
    async fn set_task_active(
        &self,
        kind: TaskKind,
        id: Uuid,
        active: bool,
    ) -> Result<bool, DatabaseError>;

    /// Checks the daily gate, credits wallet and earnings, writes the date
    /// marker and an `earning` entry, all or nothing
    async fn claim_task_reward(&self, claim: RewardClaim) -> Result<RewardOutcome, DatabaseError>;

    async fn count_active_tasks(&self, today: NaiveDate) -> Result<TaskCounts, DatabaseError>;
}

const MUSIC_COLUMNS: &str =
    "id, title, artist, audio_url, duration_seconds, reward, is_active, package_id, created_at";
const TRIVIA_COLUMNS: &str =
    "id, question, options, correct_answer, reward, is_active, package_id, created_at";

pub struct TaskRepository {
    pool: PgPool,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for TaskRepository {
    async fn find_music_task(&self, id: Uuid) -> Result<Option<MusicTask>, DatabaseError> {
        sqlx::query_as::<_, MusicTask>(&format!(
            "SELECT {} FROM music_tasks WHERE id = $1",
            MUSIC_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_trivia_question(
        &self,
        id: Uuid,
    ) -> Result<Option<TriviaQuestion>, DatabaseError> {
        sqlx::query_as::<_, TriviaQuestion>(&format!(
            "SELECT {} FROM trivia_questions WHERE id = $1",
            TRIVIA_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_active_music_tasks(&self) -> Result<Vec<MusicTask>, DatabaseError> {
        sqlx::query_as::<_, MusicTask>(&format!(
            "SELECT {} FROM music_tasks WHERE is_active ORDER BY created_at DESC",
            MUSIC_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_active_trivia_questions(&self) -> Result<Vec<TriviaQuestion>, DatabaseError> {
        sqlx::query_as::<_, TriviaQuestion>(&format!(
            "SELECT {} FROM trivia_questions WHERE is_active ORDER BY created_at DESC",
            TRIVIA_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn insert_music_task(&self, new: NewMusicTask) -> Result<MusicTask, DatabaseError> {
        let task = new.into_task();
        sqlx::query_as::<_, MusicTask>(&format!(
            "INSERT INTO music_tasks
             (id, title, artist, audio_url, duration_seconds, reward, is_active, package_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {}",
            MUSIC_COLUMNS
        ))
        .bind(task.id)
        .bind(&task.title)
        .bind(&task.artist)
        .bind(&task.audio_url)
        .bind(task.duration_seconds)
        .bind(&task.reward)
        .bind(task.is_active)
        .bind(task.package_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn insert_trivia_question(
        &self,
        new: NewTriviaQuestion,
    ) -> Result<TriviaQuestion, DatabaseError> {
        let question = new.into_question();
        sqlx::query_as::<_, TriviaQuestion>(&format!(
            "INSERT INTO trivia_questions
             (id, question, options, correct_answer, reward, is_active, package_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {}",
            TRIVIA_COLUMNS
        ))
        .bind(question.id)
        .bind(&question.question)
        .bind(&question.options)
        .bind(&question.correct_answer)
        .bind(&question.reward)
        .bind(question.is_active)
        .bind(question.package_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn set_task_active(
        &self,
        kind: TaskKind,
        id: Uuid,
        active: bool,
    ) -> Result<bool, DatabaseError> {
        let table = match kind {
            TaskKind::Music => "music_tasks",
            TaskKind::Trivia => "trivia_questions",
        };
        let result = sqlx::query(&format!("UPDATE {} SET is_active = $2 WHERE id = $1", table))
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_task_reward(&self, claim: RewardClaim) -> Result<RewardOutcome, DatabaseError> {
        let mut db_tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let credit_sql = match claim.kind {
            TaskKind::Music => {
                "UPDATE users
                 SET wallet_balance = wallet_balance + $2,
                     total_earnings = total_earnings + $2,
                     last_music_task_date = $3,
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING wallet_balance"
            }
            TaskKind::Trivia => {
                "UPDATE users
                 SET wallet_balance = wallet_balance + $2,
                     total_earnings = total_earnings + $2,
                     last_trivia_task_date = $3,
                     updated_at = NOW()
                 WHERE id = $1 AND (last_trivia_task_date IS NULL OR last_trivia_task_date < $3)
                 RETURNING wallet_balance"
            }
        };

        let balance: Option<(BigDecimal,)> = sqlx::query_as(credit_sql)
            .bind(claim.user_id)
            .bind(&claim.reward)
            .bind(claim.today)
            .fetch_optional(&mut *db_tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let Some((wallet_balance,)) = balance else {
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1")
                .bind(claim.user_id)
                .fetch_optional(&mut *db_tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            db_tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(match exists {
                Some(_) => RewardOutcome::AlreadyClaimed,
                None => RewardOutcome::UserNotFound,
            });
        };

        if claim.kind == TaskKind::Music {
            let recorded = sqlx::query(
                "INSERT INTO music_task_completions (user_id, task_id, completed_on)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (user_id, task_id, completed_on) DO NOTHING",
            )
            .bind(claim.user_id)
            .bind(claim.task_id)
            .bind(claim.today)
            .execute(&mut *db_tx)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .rows_affected();

            if recorded == 0 {
                db_tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(RewardOutcome::AlreadyClaimed);
            }
        }

        let entry = NewTransaction::completed(
            claim.user_id,
            TransactionType::Earning,
            claim.reward,
            claim.description,
        );
        let transaction = insert_ledger_entry(&mut *db_tx, entry).await?;

        db_tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        Ok(RewardOutcome::Granted {
            wallet_balance,
            transaction,
        })
    }

    async fn count_active_tasks(&self, today: NaiveDate) -> Result<TaskCounts, DatabaseError> {
        sqlx::query_as::<_, TaskCounts>(
            "SELECT
                (SELECT COUNT(*) FROM music_tasks WHERE is_active) AS active_music_tasks,
                (SELECT COUNT(*) FROM trivia_questions WHERE is_active) AS active_trivia_questions,
                (SELECT COUNT(*) FROM music_task_completions WHERE completed_on = $1)
                    AS music_completions_today",
        )
        .bind(today)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
