//! Scheduler tests: persistence ordering, rollback, timeouts, shutdown

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use mockall::mock;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio_test::{assert_err, assert_ok};
    use tradeguard::audit::MemoryAuditLog;
    use tradeguard::config::GuardConfig;
    use tradeguard::orchestrator::{CycleKind, GuardOrchestrator};
    use tradeguard::providers::{AccountProvider, ActionDispatcher, NewsProvider};
    use tradeguard::scheduler::{Scheduler, SchedulerSettings};
    use tradeguard::state::{GuardState, MemoryStateStore, StateStore};
    use tradeguard::types::{AccountSnapshot, Action, Direction, GuardKind, Impact, NewsEvent, Position};
    use tradeguard::{GuardError, Result};

    mock! {
        pub Broker {}
        #[async_trait]
        impl AccountProvider for Broker {
            async fn snapshot(&self) -> Result<AccountSnapshot>;
        }
    }

    mock! {
        pub Calendar {}
        #[async_trait]
        impl NewsProvider for Calendar {
            async fn events(&self) -> Result<Vec<NewsEvent>>;
        }
    }

    mock! {
        pub Dispatcher {}
        #[async_trait]
        impl ActionDispatcher for Dispatcher {
            async fn dispatch(&self, action: &Action) -> Result<()>;
        }
    }

    mock! {
        pub Store {}
        impl StateStore for Store {
            fn load(&self, scope: &str) -> Result<GuardState>;
            fn save(&self, scope: &str, state: &GuardState) -> Result<()>;
        }
    }

    /// Broker that never answers in time
    struct SlowBroker;

    #[async_trait]
    impl AccountProvider for SlowBroker {
        async fn snapshot(&self) -> Result<AccountSnapshot> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(GuardError::unavailable("slow broker", "unreachable"))
        }
    }

    const SCOPE: &str = "acct-77";

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            scope: SCOPE.to_string(),
            tick: Duration::from_secs(3600),
            fast_tick: None,
            provider_timeout: Duration::from_millis(200),
            watch_symbols: vec!["EURUSD".to_string()],
        }
    }

    fn snapshot(pnl: Decimal, with_position: bool) -> AccountSnapshot {
        let now = at(13, 0);
        let positions = if with_position {
            vec![Position {
                id: "5001".to_string(),
                symbol: "EURUSD".to_string(),
                direction: Direction::Long,
                volume: dec!(1.00),
                entry_price: dec!(1.10000),
                current_price: if pnl < Decimal::ZERO { dec!(1.09850) } else { dec!(1.10100) },
                opened_at: now - ChronoDuration::minutes(10),
                stop_loss: Some(dec!(1.09500)),
                take_profit: None,
                profit: pnl,
            }]
        } else {
            Vec::new()
        };
        AccountSnapshot {
            balance: dec!(10000),
            floating_pnl: pnl,
            closed_pnl_today: Decimal::ZERO,
            positions,
            timestamp: now,
        }
    }

    fn broker(pnl: Decimal) -> MockBroker {
        let mut broker = MockBroker::new();
        broker
            .expect_snapshot()
            .returning(move || Ok(snapshot(pnl, true)));
        broker
    }

    fn quiet_calendar() -> MockCalendar {
        let mut calendar = MockCalendar::new();
        calendar.expect_events().returning(|| Ok(Vec::new()));
        calendar
    }

    fn scheduler(
        account: Arc<dyn AccountProvider>,
        news: Arc<dyn NewsProvider>,
        dispatcher: Arc<dyn ActionDispatcher>,
        store: Arc<dyn StateStore>,
    ) -> Scheduler {
        Scheduler::new(
            GuardOrchestrator::new(GuardConfig::default()),
            account,
            news,
            dispatcher,
            store,
            Arc::new(MemoryAuditLog::new()),
            settings(),
        )
        .unwrap()
    }

    // ============================================================================
    // Persistence ordering
    // ============================================================================

    #[tokio::test]
    async fn test_state_is_persisted_before_dispatch() {
        let store = Arc::new(MemoryStateStore::new());
        let seen = store.clone();

        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_dispatch().returning(move |action| {
            if let Action::ClosePositions { .. } = action {
                let persisted = seen.get(SCOPE).expect("state written before dispatch");
                assert!(persisted.partial_close_done);
            }
            Ok(())
        });

        let mut sched = scheduler(
            Arc::new(broker(dec!(100))),
            Arc::new(quiet_calendar()),
            Arc::new(dispatcher),
            store.clone(),
        );
        let report = assert_ok!(sched.run_cycle_at(CycleKind::Full, at(13, 0)).await);

        assert_eq!(report.failed, 0);
        assert!(report.dispatched >= 2);
        assert!(store.get(SCOPE).unwrap().partial_close_done);
    }

    #[tokio::test]
    async fn test_failed_close_rolls_back_and_retries() {
        let store = Arc::new(MemoryStateStore::new());

        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_dispatch()
            .withf(|a| matches!(a, Action::ClosePositions { .. }))
            .times(1)
            .returning(|_| Err(GuardError::ActionDispatchFailure("requote".to_string())));
        dispatcher
            .expect_dispatch()
            .withf(|a| matches!(a, Action::ClosePositions { .. }))
            .times(1)
            .returning(|_| Ok(()));
        dispatcher.expect_dispatch().returning(|_| Ok(()));

        let mut sched = scheduler(
            Arc::new(broker(dec!(100))),
            Arc::new(quiet_calendar()),
            Arc::new(dispatcher),
            store.clone(),
        );

        let report = sched.run_cycle_at(CycleKind::Full, at(13, 0)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.rolled_back);
        assert!(!sched.state().partial_close_done);
        assert!(!store.get(SCOPE).unwrap().partial_close_done);

        let report = sched.run_cycle_at(CycleKind::Full, at(13, 15)).await.unwrap();
        assert_eq!(report.failed, 0);
        assert!(store.get(SCOPE).unwrap().partial_close_done);
    }

    #[tokio::test]
    async fn test_rejected_stop_move_keeps_partial_close_done() {
        let store = Arc::new(MemoryStateStore::new());
        let partial_closes = Arc::new(AtomicUsize::new(0));
        let counter = partial_closes.clone();

        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_dispatch().returning(move |action| match action {
            Action::ClosePositions { .. } => {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Action::ModifyStopLoss { .. } => {
                Err(GuardError::ActionDispatchFailure("invalid stops".to_string()))
            }
            _ => Ok(()),
        });

        let mut sched = scheduler(
            Arc::new(broker(dec!(120))),
            Arc::new(quiet_calendar()),
            Arc::new(dispatcher),
            store.clone(),
        );

        for m in 0..3 {
            let report = assert_ok!(sched.run_cycle_at(CycleKind::Fast, at(13, m)).await);
            if m == 0 {
                assert!(report.rolled_back);
            }
        }

        assert_eq!(partial_closes.load(Ordering::SeqCst), 1);
        assert!(store.get(SCOPE).unwrap().partial_close_done);
    }

    #[tokio::test]
    async fn test_failed_block_does_not_roll_back() {
        let store = Arc::new(MemoryStateStore::new());
        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_dispatch()
            .returning(|_| Err(GuardError::ActionDispatchFailure("bridge offline".to_string())));

        let mut sched = scheduler(
            Arc::new(broker(dec!(-150))),
            Arc::new(quiet_calendar()),
            Arc::new(dispatcher),
            store.clone(),
        );
        let report = sched.run_cycle_at(CycleKind::Full, at(13, 0)).await.unwrap();

        assert!(!report.rolled_back);
        assert!(store.get(SCOPE).unwrap().drawdown_block_active);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal_and_nothing_dispatched() {
        let mut store = MockStore::new();
        store.expect_load().returning(|_| Ok(GuardState::default()));
        store
            .expect_save()
            .returning(|_, _| Err(GuardError::PersistenceCorrupt("disk full".to_string())));

        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_dispatch().never();

        let mut sched = scheduler(
            Arc::new(broker(dec!(250))),
            Arc::new(quiet_calendar()),
            Arc::new(dispatcher),
            Arc::new(store),
        );
        let err = assert_err!(sched.run_cycle_at(CycleKind::Full, at(13, 0)).await);
        assert!(err.is_fatal());
    }

    // ============================================================================
    // Data availability
    // ============================================================================

    #[tokio::test]
    async fn test_broker_timeout_blocks_without_closing() {
        let store = Arc::new(MemoryStateStore::new());
        let prior = GuardState {
            partial_close_done: true,
            ..GuardState::default()
        };
        store.save(SCOPE, &prior).unwrap();

        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_dispatch()
            .withf(|a| a.mutates_positions())
            .never();
        dispatcher
            .expect_dispatch()
            .withf(|a| a.origin() == GuardKind::Orchestrator)
            .times(1)
            .returning(|_| Ok(()));

        let mut sched = scheduler(
            Arc::new(SlowBroker),
            Arc::new(quiet_calendar()),
            Arc::new(dispatcher),
            store.clone(),
        );
        let report = sched.run_cycle_at(CycleKind::Full, at(19, 45)).await.unwrap();

        assert!(report.verdict.is_blocked());
        let persisted = store.get(SCOPE).unwrap();
        assert!(persisted.partial_close_done);
        assert_eq!(persisted.last_cycle_at, Some(at(19, 45)));
        assert!(!sched.gate().read().await.allows("EURUSD"));
    }

    // ============================================================================
    // Entry gate
    // ============================================================================

    #[tokio::test]
    async fn test_fast_cycle_keeps_news_blocks_from_full_cycle() {
        let mut broker = MockBroker::new();
        broker
            .expect_snapshot()
            .returning(|| Ok(snapshot(Decimal::ZERO, false)));

        let mut calendar = MockCalendar::new();
        calendar.expect_events().times(1).returning(|| {
            Ok(vec![NewsEvent {
                name: "ECB Rate Decision".to_string(),
                time: Utc.with_ymd_and_hms(2024, 3, 4, 13, 15, 0).unwrap(),
                currency: "EUR".to_string(),
                impact: Impact::High,
            }])
        });

        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_dispatch().returning(|_| Ok(()));

        let mut sched = scheduler(
            Arc::new(broker),
            Arc::new(calendar),
            Arc::new(dispatcher),
            Arc::new(MemoryStateStore::new()),
        );

        sched.run_cycle_at(CycleKind::Full, at(13, 0)).await.unwrap();
        sched.run_cycle_at(CycleKind::Fast, at(13, 1)).await.unwrap();

        let gate = sched.gate();
        let gate = gate.read().await;
        assert!(!gate.allows("EURUSD"));
        assert!(gate.allows("AUDJPY"));
        assert_eq!(gate.session.as_ref().map(|s| s.name.as_str()), Some("ny_am"));
    }

    // ============================================================================
    // Shutdown
    // ============================================================================

    #[tokio::test]
    async fn test_shutdown_finishes_cycle_and_persists() {
        let store = Arc::new(MemoryStateStore::new());

        let mut broker = MockBroker::new();
        broker
            .expect_snapshot()
            .returning(|| Ok(snapshot(Decimal::ZERO, false)));
        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_dispatch().returning(|_| Ok(()));

        let sched = scheduler(
            Arc::new(broker),
            Arc::new(quiet_calendar()),
            Arc::new(dispatcher),
            store.clone(),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sched.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
        assert!(store.get(SCOPE).unwrap().last_cycle_at.is_some());
    }
}
