pub mod config;
pub mod csv;
pub mod engine;
pub mod model;
pub mod outcome;
pub mod policy;
pub mod repository;
pub mod store;

pub use config::Config;
pub use engine::{Coordinator, CouponError, TxnError, UnitOfWork};
pub use model::{Coupon, CouponId, Isolation, LockMode, User, UserId, WaitPolicy};
pub use outcome::{ErrorKind, Outcome};
pub use policy::{AssignRequest, CouponService, Policy};
