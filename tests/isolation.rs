use coupon_race::outcome::report;
use coupon_race::{Config, Coordinator, CouponService, Isolation, TxnError, UserId};

/// A service seeded with `{code: "C1", redeemed: false}` and one user.
fn seeded(config: Config) -> (CouponService, UserId) {
    let service = CouponService::new(config);
    service.seed_coupon("C1").unwrap();
    let user = service.create_user("user1").unwrap();
    (service, user.id)
}

/// Redeem coupon `C1` for `user` in a unit of work that is left open.
async fn redeem_uncommitted(coordinator: &Coordinator, user: UserId) -> coupon_race::UnitOfWork {
    let mut writer = coordinator.begin(Some(Isolation::ReadCommitted));
    let mut coupon = writer.find_coupon_by_code("C1").unwrap().unwrap();
    coupon.redeem(user);
    writer.save(&coupon).await.unwrap();
    writer
}

async fn redeem_committed(coordinator: &Coordinator, user: UserId) {
    let mut writer = redeem_uncommitted(coordinator, user).await;
    writer.commit().unwrap();
}

fn redeemed(unit: &mut coupon_race::UnitOfWork) -> bool {
    unit.find_coupon_by_code("C1").unwrap().unwrap().redeemed
}

#[tokio::test]
async fn read_uncommitted_sees_a_dirty_write_that_is_later_rolled_back() {
    let (service, user) = seeded(Config::default());
    let coordinator = service.coordinator();

    let mut reader = coordinator.begin(Some(Isolation::ReadUncommitted));
    let mut writer = redeem_uncommitted(coordinator, user).await;

    assert!(redeemed(&mut reader));
    writer.rollback().unwrap();
    assert!(!redeemed(&mut reader));
}

#[tokio::test]
async fn stronger_levels_never_see_uncommitted_writes() {
    for isolation in [
        Isolation::ReadCommitted,
        Isolation::RepeatableRead,
        Isolation::Serializable,
    ] {
        let (service, user) = seeded(Config::default());
        let coordinator = service.coordinator();

        let mut reader = coordinator.begin(Some(isolation));
        let _writer = redeem_uncommitted(coordinator, user).await;
        assert!(!redeemed(&mut reader), "{isolation}");
    }
}

#[tokio::test]
async fn weak_levels_allow_non_repeatable_reads() {
    for isolation in [Isolation::ReadUncommitted, Isolation::ReadCommitted] {
        let (service, user) = seeded(Config::default());
        let coordinator = service.coordinator();

        let mut reader = coordinator.begin(Some(isolation));
        let first = reader.find_coupon(1).unwrap();
        redeem_committed(coordinator, user).await;
        let second = reader.find_coupon(1).unwrap();

        assert!(!first.unwrap().redeemed, "{isolation}");
        assert!(second.unwrap().redeemed, "{isolation}");
    }
}

#[tokio::test]
async fn lookup_by_code_misses_unknown_codes() {
    let (service, _) = seeded(Config::default());
    let mut reader = service.coordinator().begin(None);
    assert_eq!(reader.find_coupon_by_code("C1").unwrap().unwrap().id, 1);
    assert_eq!(reader.find_coupon_by_code("NOPE").unwrap(), None);
}

#[tokio::test]
async fn repeatable_read_suppresses_non_repeatable_reads() {
    for isolation in [Isolation::RepeatableRead, Isolation::Serializable] {
        let (service, user) = seeded(Config::default());
        let coordinator = service.coordinator();

        let mut reader = coordinator.begin(Some(isolation));
        let first = reader.find_coupon(1).unwrap();
        redeem_committed(coordinator, user).await;
        let second = reader.find_coupon(1).unwrap();

        assert_eq!(first, second, "{isolation}");
        reader.commit().unwrap();
    }
}

#[tokio::test]
async fn phantom_reads_depend_on_isolation() {
    let cases = [
        (Isolation::ReadUncommitted, 2),
        (Isolation::ReadCommitted, 2),
        (Isolation::RepeatableRead, 1),
        (Isolation::Serializable, 1),
    ];
    for (isolation, second_count) in cases {
        let (service, _) = seeded(Config::default());

        let mut reader = service.coordinator().begin(Some(isolation));
        let first = reader.find_all_unredeemed().unwrap();
        service.seed_coupon("C2").unwrap();
        let second = reader.find_all_unredeemed().unwrap();

        assert_eq!(first.len(), 1, "{isolation}");
        assert_eq!(second.len(), second_count, "{isolation}");
    }
}

#[tokio::test]
async fn repeatable_read_phantoms_appear_without_engine_protection() {
    let config = Config::default().with_repeatable_read_phantom_protection(false);
    let (service, user) = seeded(config);
    let coordinator = service.coordinator();

    let mut reader = coordinator.begin(Some(Isolation::RepeatableRead));
    assert_eq!(reader.find_all_unredeemed().unwrap().len(), 1);
    service.seed_coupon("C2").unwrap();
    assert_eq!(reader.find_all_unredeemed().unwrap().len(), 2);

    // existing rows still come from the snapshot
    redeem_committed(coordinator, user).await;
    assert!(!redeemed(&mut reader));
}

#[tokio::test]
async fn locking_reads_see_the_latest_commit_under_repeatable_read() {
    let (service, user) = seeded(Config::default());
    let coordinator = service.coordinator();

    let mut reader = coordinator.begin(Some(Isolation::RepeatableRead));
    assert_eq!(reader.find_all_unredeemed().unwrap().len(), 1);
    redeem_committed(coordinator, user).await;

    let locked = reader
        .query()
        .with_lock(
            coupon_race::LockMode::Shared,
            coupon_race::WaitPolicy::NoWait,
        )
        .all_unredeemed()
        .await
        .unwrap();
    assert!(locked.is_empty());
    assert_eq!(reader.find_all_unredeemed().unwrap().len(), 1);
}

#[tokio::test]
async fn misused_units_of_work_are_internal_faults() {
    let (service, _) = seeded(Config::default());
    let coordinator = service.coordinator();

    let mut idle = coordinator.create_unit_of_work();
    let err = idle.find_all_unredeemed().unwrap_err();
    assert_eq!(err, TxnError::NotStarted(idle.id()));
    assert_eq!(report(None, Err(err.clone())), Err(err));

    let mut done = coordinator.begin(None);
    done.commit().unwrap();
    let err = done.find_coupon(1).unwrap_err();
    assert_eq!(err, TxnError::Finished(done.id()));
    assert_eq!(report(None, Err(err.clone())), Err(err));
}
