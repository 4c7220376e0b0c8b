//! Autocommit repositories over the store.
//!
//! Every call runs as its own single-statement unit of work, the way an ORM
//! repository behaves outside an explicit transaction. Contended paths use a
//! [`UnitOfWork`](crate::engine::UnitOfWork) directly instead.

use crate::engine::{Coordinator, TxnError, UnitOfWork};
use crate::model::{Coupon, CouponId, CouponPatch, User, UserId, Version};

/// Row selector of a conditional update: `WHERE id = ? [AND version = ?]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keyset {
    pub id: CouponId,
    pub version: Option<Version>,
}

impl Keyset {
    pub fn id(id: CouponId) -> Self {
        Self { id, version: None }
    }

    pub fn versioned(id: CouponId, version: Version) -> Self {
        Self {
            id,
            version: Some(version),
        }
    }
}

#[derive(Clone)]
pub struct CouponRepository {
    coordinator: Coordinator,
}

impl CouponRepository {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    pub fn insert(&self, code: &str) -> Result<Coupon, TxnError> {
        let mut unit = self.coordinator.begin(None);
        let result = unit.insert_coupon(code);
        unit.settle(result)
    }

    pub fn find_by_id(&self, id: CouponId) -> Result<Option<Coupon>, TxnError> {
        self.statement(|unit| unit.find_coupon(id))
    }

    /// Lowest-id coupon matching `predicate`.
    pub fn find_one(
        &self,
        predicate: impl Fn(&Coupon) -> bool,
    ) -> Result<Option<Coupon>, TxnError> {
        self.statement(|unit| Ok(unit.find_coupons(predicate)?.into_iter().next()))
    }

    pub fn find_one_unredeemed(&self) -> Result<Option<Coupon>, TxnError> {
        self.statement(|unit| unit.find_one_unredeemed())
    }

    pub fn find_many(&self, predicate: impl Fn(&Coupon) -> bool) -> Result<Vec<Coupon>, TxnError> {
        self.statement(|unit| unit.find_coupons(predicate))
    }

    pub async fn save(&self, coupon: &Coupon) -> Result<Coupon, TxnError> {
        let mut unit = self.coordinator.begin(None);
        let result = unit.save(coupon).await;
        unit.settle(result)
    }

    /// Apply `patch` to the row selected by `keyset`; returns the affected row count.
    pub async fn update(&self, keyset: Keyset, patch: CouponPatch) -> Result<u64, TxnError> {
        let mut unit = self.coordinator.begin(None);
        let result = unit.apply_patch(keyset.id, patch, keyset.version).await;
        unit.settle(result).map(u64::from)
    }

    pub async fn delete_all(&self) -> Result<usize, TxnError> {
        let mut unit = self.coordinator.begin(None);
        let result = unit.delete_all_coupons().await;
        unit.settle(result)
    }

    fn statement<T>(
        &self,
        read: impl FnOnce(&mut UnitOfWork) -> Result<T, TxnError>,
    ) -> Result<T, TxnError> {
        let mut unit = self.coordinator.begin(None);
        let result = read(&mut unit);
        unit.settle(result)
    }
}

#[derive(Clone)]
pub struct UserRepository {
    coordinator: Coordinator,
}

impl UserRepository {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    pub fn save(&self, name: &str) -> Result<User, TxnError> {
        let mut unit = self.coordinator.begin(None);
        let result = unit.insert_user(name);
        unit.settle(result)
    }

    pub fn find(&self, id: UserId) -> Result<Option<User>, TxnError> {
        let mut unit = self.coordinator.begin(None);
        let result = unit.find_user(id);
        unit.settle(result)
    }

    pub fn delete_all(&self) -> Result<usize, TxnError> {
        let mut unit = self.coordinator.begin(None);
        let result = unit.delete_all_users();
        unit.settle(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn repositories() -> (CouponRepository, UserRepository) {
        let coordinator = Coordinator::new(Config::default());
        (
            CouponRepository::new(coordinator.clone()),
            UserRepository::new(coordinator),
        )
    }

    #[test]
    fn inserted_rows_are_committed() {
        let (coupons, users) = repositories();
        let coupon = coupons.insert("C1").unwrap();
        let user = users.save("user1").unwrap();

        assert_eq!(coupons.find_by_id(coupon.id).unwrap(), Some(coupon));
        assert_eq!(users.find(user.id).unwrap(), Some(user));
    }

    #[test]
    fn find_one_returns_lowest_matching_id() {
        let (coupons, _) = repositories();
        for code in ["A", "B", "B"] {
            coupons.insert(code).unwrap();
        }
        let found = coupons.find_one(|c| c.code == "B").unwrap().unwrap();
        assert_eq!(found.id, 2);
        assert_eq!(coupons.find_many(|c| c.code == "B").unwrap().len(), 2);
        assert_eq!(coupons.find_one(|c| c.code == "Z").unwrap(), None);
    }

    #[tokio::test]
    async fn versioned_update_affects_zero_rows_on_mismatch() {
        let (coupons, users) = repositories();
        let coupon = coupons.insert("C1").unwrap();
        let user = users.save("user1").unwrap();

        let patch = CouponPatch::redeem(user.id);
        assert_eq!(coupons.update(Keyset::versioned(coupon.id, 5), patch).await, Ok(0));
        assert_eq!(coupons.update(Keyset::versioned(coupon.id, 0), patch).await, Ok(1));
        assert_eq!(coupons.update(Keyset::versioned(coupon.id, 0), patch).await, Ok(0));

        let stored = coupons.find_by_id(coupon.id).unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.owner, Some(user.id));
        assert_eq!(coupons.find_one_unredeemed().unwrap(), None);
    }

    #[tokio::test]
    async fn unkeyed_update_always_applies() {
        let (coupons, users) = repositories();
        let coupon = coupons.insert("C1").unwrap();
        let user = users.save("user1").unwrap();

        let patch = CouponPatch::redeem(user.id);
        assert_eq!(coupons.update(Keyset::id(coupon.id), patch).await, Ok(1));
        assert_eq!(coupons.update(Keyset::id(coupon.id), patch).await, Ok(1));
        assert_eq!(coupons.find_by_id(coupon.id).unwrap().unwrap().version, 2);
        assert_eq!(coupons.update(Keyset::id(99), patch).await, Ok(0));
    }

    #[tokio::test]
    async fn save_of_missing_row_is_an_error() {
        let (coupons, _) = repositories();
        let ghost = Coupon::new(42, "ghost");
        assert_eq!(coupons.save(&ghost).await, Err(TxnError::CouponNotFound(42)));
    }

    #[tokio::test]
    async fn delete_all_empties_both_tables() {
        let (coupons, users) = repositories();
        coupons.insert("C1").unwrap();
        coupons.insert("C2").unwrap();
        users.save("user1").unwrap();

        assert_eq!(coupons.delete_all().await, Ok(2));
        assert_eq!(users.delete_all(), Ok(1));
        assert!(coupons.find_many(|_| true).unwrap().is_empty());
    }
}
