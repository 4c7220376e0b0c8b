//! Coupon assignment under each contention policy, and the race harness.

use std::fmt;

use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{Coordinator, CouponError, TxnError, UnitOfWork};
use crate::model::{Coupon, CouponPatch, Isolation, RowLock, User, UserId, WaitPolicy};
use crate::outcome::{Outcome, report};
use crate::repository::{CouponRepository, UserRepository};

/// How an assignment protects its read-then-write against other callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Policy {
    /// Plain read, unconditional save. Lost updates are possible.
    NoLock,
    /// `FOR SHARE`, then upgrade to exclusive for the write.
    PessimisticRead,
    /// `FOR UPDATE`, waiting for the holder.
    PessimisticWrite,
    /// `FOR UPDATE NOWAIT`.
    PessimisticWriteNoWait,
    /// Plain read, update conditioned on the version read.
    Optimistic,
    /// Serializable isolation, certified against concurrent writers.
    Serializable,
}

impl Policy {
    pub const ALL: [Policy; 6] = [
        Policy::NoLock,
        Policy::PessimisticRead,
        Policy::PessimisticWrite,
        Policy::PessimisticWriteNoWait,
        Policy::Optimistic,
        Policy::Serializable,
    ];

    /// Rank by how early contention is detected; higher is stricter.
    ///
    /// Blocking exclusive locks and serializable isolation rank equal.
    pub fn strictness(self) -> u8 {
        match self {
            Policy::NoLock => 0,
            Policy::PessimisticRead => 1,
            Policy::Optimistic => 2,
            Policy::PessimisticWrite | Policy::Serializable => 3,
            Policy::PessimisticWriteNoWait => 4,
        }
    }

    /// Whether concurrent callers racing for one coupon produce exactly one winner.
    pub fn awards_exactly_once(self) -> bool {
        self != Policy::NoLock
    }

    pub fn name(self) -> &'static str {
        match self {
            Policy::NoLock => "no-lock",
            Policy::PessimisticRead => "pessimistic-read",
            Policy::PessimisticWrite => "pessimistic-write",
            Policy::PessimisticWriteNoWait => "pessimistic-write-no-wait",
            Policy::Optimistic => "optimistic",
            Policy::Serializable => "serializable",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One caller asking for a coupon under a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignRequest {
    pub user: UserId,
    pub policy: Policy,
}

/// Assigns coupons to users.
#[derive(Clone)]
pub struct CouponService {
    coordinator: Coordinator,
}

/// Public API
impl CouponService {
    pub fn new(config: Config) -> Self {
        Self::with_coordinator(Coordinator::new(config))
    }

    pub fn with_coordinator(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn coupons(&self) -> CouponRepository {
        CouponRepository::new(self.coordinator.clone())
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.coordinator.clone())
    }

    pub fn create_user(&self, name: &str) -> Result<User, CouponError> {
        Ok(self.users().save(name)?)
    }

    pub fn seed_coupon(&self, code: &str) -> Result<Coupon, CouponError> {
        Ok(self.coupons().insert(code)?)
    }

    /// Delete every coupon and user.
    pub async fn reset(&self) -> Result<(), CouponError> {
        let coupons = self.coupons().delete_all().await?;
        let users = self.users().delete_all()?;
        debug!(coupons, users, "store reset");
        Ok(())
    }

    pub async fn assign(&self, user: UserId, policy: Policy) -> Result<Outcome, CouponError> {
        match policy {
            Policy::NoLock => self.assign_without_lock(user).await,
            Policy::PessimisticRead => self.assign_with_pessimistic_read_lock(user).await,
            Policy::PessimisticWrite => self.assign_with_pessimistic_write_lock(user).await,
            Policy::PessimisticWriteNoWait => {
                self.assign_with_pessimistic_write_lock_no_wait(user).await
            }
            Policy::Optimistic => self.assign_with_optimistic_lock(user).await,
            Policy::Serializable => self.assign_with_serializable_isolation(user).await,
        }
    }

    /// Plain read then save. Concurrent callers can both "win" the same coupon;
    /// the last write survives.
    pub async fn assign_without_lock(&self, user: UserId) -> Result<Outcome, CouponError> {
        let mut unit = self.coordinator.begin(None);
        let mut read = None;
        let result = async {
            ensure_user(&mut unit, user)?;
            let mut coupon = unit
                .find_one_unredeemed()?
                .ok_or(TxnError::NoAvailableCoupon)?;
            read = Some(coupon.clone());
            self.think().await;
            coupon.redeem(user);
            unit.save(&coupon).await
        }
        .await;
        self.finish(Policy::NoLock, user, &mut unit, read, result)
    }

    /// Shared lock on the read; the write upgrades it. Two concurrent upgraders
    /// deadlock and one of them is rolled back.
    pub async fn assign_with_pessimistic_read_lock(
        &self,
        user: UserId,
    ) -> Result<Outcome, CouponError> {
        let mut unit = self.coordinator.begin(None);
        let mut read = None;
        let result = async {
            ensure_user(&mut unit, user)?;
            let mut coupon = locked_candidate(&mut unit, RowLock::shared()).await?;
            read = Some(coupon.clone());
            self.think().await;
            coupon.redeem(user);
            unit.save(&coupon).await
        }
        .await;
        self.finish(Policy::PessimisticRead, user, &mut unit, read, result)
    }

    /// Exclusive lock on the read. A loser waits for the winner, then finds
    /// nothing left.
    pub async fn assign_with_pessimistic_write_lock(
        &self,
        user: UserId,
    ) -> Result<Outcome, CouponError> {
        let mut unit = self.coordinator.begin(None);
        let mut read = None;
        let result = async {
            ensure_user(&mut unit, user)?;
            let mut coupon = locked_candidate(&mut unit, RowLock::exclusive()).await?;
            read = Some(coupon.clone());
            self.think().await;
            coupon.redeem(user);
            unit.save(&coupon).await
        }
        .await;
        self.finish(Policy::PessimisticWrite, user, &mut unit, read, result)
    }

    /// Exclusive lock on the read without waiting. A loser fails right away.
    pub async fn assign_with_pessimistic_write_lock_no_wait(
        &self,
        user: UserId,
    ) -> Result<Outcome, CouponError> {
        let mut unit = self.coordinator.begin(None);
        let mut read = None;
        let result = async {
            ensure_user(&mut unit, user)?;
            let lock = RowLock::exclusive().with_wait(WaitPolicy::NoWait);
            let mut coupon = locked_candidate(&mut unit, lock).await?;
            read = Some(coupon.clone());
            self.think().await;
            coupon.redeem(user);
            unit.save(&coupon).await
        }
        .await;
        self.finish(Policy::PessimisticWriteNoWait, user, &mut unit, read, result)
    }

    /// Plain read, then an update keyed on the version read. A loser's update
    /// matches no row.
    pub async fn assign_with_optimistic_lock(&self, user: UserId) -> Result<Outcome, CouponError> {
        let mut unit = self.coordinator.begin(None);
        let mut read = None;
        let result = async {
            ensure_user(&mut unit, user)?;
            let coupon = unit
                .find_one_unredeemed()?
                .ok_or(TxnError::NoAvailableCoupon)?;
            read = Some(coupon.clone());
            self.think().await;

            let updated = unit
                .apply_patch(coupon.id, CouponPatch::redeem(user), Some(coupon.version))
                .await?;
            if !updated {
                return Err(TxnError::VersionConflict {
                    row: coupon.id,
                    expected: coupon.version,
                });
            }
            unit.find_coupon(coupon.id)?
                .ok_or(TxnError::CouponNotFound(coupon.id))
        }
        .await;
        self.finish(Policy::Optimistic, user, &mut unit, read, result)
    }

    /// Plain read and save inside a serializable unit of work. A loser is
    /// rejected once the winner's commit is detected.
    pub async fn assign_with_serializable_isolation(
        &self,
        user: UserId,
    ) -> Result<Outcome, CouponError> {
        let mut unit = self.coordinator.begin(Some(Isolation::Serializable));
        let mut read = None;
        let result = async {
            ensure_user(&mut unit, user)?;
            let mut coupon = unit
                .find_one_unredeemed()?
                .ok_or(TxnError::NoAvailableCoupon)?;
            read = Some(coupon.clone());
            self.think().await;
            coupon.redeem(user);
            unit.save(&coupon).await
        }
        .await;
        self.finish(Policy::Serializable, user, &mut unit, read, result)
    }

    /// Run every request as its own task and collect outcomes in request order.
    pub async fn run(
        &self,
        mut requests: impl Stream<Item = AssignRequest> + Unpin,
    ) -> Result<Vec<Outcome>, CouponError> {
        let mut tasks = Vec::new();
        while let Some(request) = requests.next().await {
            let service = self.clone();
            tasks.push(tokio::spawn(async move {
                service.assign(request.user, request.policy).await
            }));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            outcomes.push(task.await??);
        }
        Ok(outcomes)
    }

    /// Race `users` against each other under one policy.
    pub async fn race(&self, policy: Policy, users: &[UserId]) -> Result<Vec<Outcome>, CouponError> {
        let requests = users
            .iter()
            .map(|&user| AssignRequest { user, policy })
            .collect::<Vec<_>>();
        let outcomes = self.run(tokio_stream::iter(requests)).await?;

        let winners = outcomes.iter().filter(|o| o.won()).count();
        info!(%policy, contenders = users.len(), winners, "race finished");
        Ok(outcomes)
    }
}

/// Private API
impl CouponService {
    async fn think(&self) {
        let think_time = self.coordinator.config().think_time;
        if !think_time.is_zero() {
            tokio::time::sleep(think_time).await;
        }
    }

    fn finish(
        &self,
        policy: Policy,
        user: UserId,
        unit: &mut UnitOfWork,
        read: Option<Coupon>,
        result: Result<Coupon, TxnError>,
    ) -> Result<Outcome, CouponError> {
        let result = unit.settle(result);
        let outcome = report(read, result).inspect_err(|err| {
            warn!(%policy, user, txn = %unit.id(), error = %err, "assignment failed");
        })?;

        match (&outcome.written, outcome.error) {
            (Some(coupon), _) => info!(
                %policy,
                user,
                coupon = coupon.id,
                version = coupon.version,
                "coupon assigned"
            ),
            (None, Some(reason)) => info!(%policy, user, %reason, "coupon not assigned"),
            (None, None) => {}
        }
        Ok(outcome)
    }
}

async fn locked_candidate(unit: &mut UnitOfWork, lock: RowLock) -> Result<Coupon, TxnError> {
    unit.query()
        .with_lock(lock.mode, lock.wait)
        .one_unredeemed()
        .await?
        .ok_or(TxnError::NoAvailableCoupon)
}

fn ensure_user(unit: &mut UnitOfWork, user: UserId) -> Result<(), TxnError> {
    match unit.find_user(user)? {
        Some(_) => Ok(()),
        None => Err(TxnError::Validation(format!("unknown user {user}"))),
    }
}
