// tests/property/sequence.rs

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{Value, json};
use taskexec::resource::{Resource, ResourceGraph, Scope, SequenceBuilder, SequenceEntry};
use taskexec::task::{Action, Params};
use taskexec_test_utils::builders::{database, database_user, domain, ssl_certificate, unix_account, website};
use taskexec_test_utils::fakes::{FakeServices, InMemoryCatalog};

const CERTS: usize = 4;

#[derive(Debug, Clone)]
struct WebsiteShape {
    account_on: bool,
    certs_on: Vec<bool>,
    /// Per domain, the index of its certificate if it has one.
    domains: Vec<Option<usize>>,
}

fn website_strategy() -> impl Strategy<Value = WebsiteShape> {
    (
        any::<bool>(),
        proptest::collection::vec(any::<bool>(), CERTS),
        proptest::collection::vec(proptest::option::of(0..CERTS), 0..6),
    )
        .prop_map(|(account_on, certs_on, domains)| WebsiteShape {
            account_on,
            certs_on,
            domains,
        })
}

fn switched(mut resource: Value, on: bool) -> Value {
    resource["switchedOn"] = json!(on);
    resource
}

fn build_website(shape: &WebsiteShape) -> Value {
    let account = switched(unix_account("u1", "u7001"), shape.account_on);
    let domains = shape
        .domains
        .iter()
        .enumerate()
        .map(|(i, cert)| {
            let cert = cert.map(|c| {
                switched(ssl_certificate(&format!("c{c}"), &format!("cert{c}")), shape.certs_on[c])
            });
            domain(&format!("d{i}"), &format!("site{i}.example"), cert)
        })
        .collect();
    website("w1", "site", account, domains)
}

fn build_sequence(res_type: &str, resource: Value, action: Action) -> Vec<SequenceEntry> {
    build_sequence_with(InMemoryCatalog::new(), res_type, resource, action)
}

fn build_sequence_with(
    catalog: InMemoryCatalog,
    res_type: &str,
    resource: Value,
    action: Action,
) -> Vec<SequenceEntry> {
    let graph = ResourceGraph::new(Arc::new(catalog), Arc::new(FakeServices::default()));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime
        .block_on(SequenceBuilder::new(&graph).build(
            res_type,
            &Resource::from(resource),
            action,
            &Params::new(),
        ))
        .unwrap()
}

/// Databases `d0..` each granting a subset of users `u0..`.
#[derive(Debug, Clone)]
struct GrantShape {
    users: usize,
    /// `grants[db][user]`
    grants: Vec<Vec<bool>>,
}

fn grant_strategy() -> impl Strategy<Value = GrantShape> {
    (1..5usize, 1..5usize).prop_flat_map(|(users, dbs)| {
        proptest::collection::vec(proptest::collection::vec(any::<bool>(), users), dbs)
            .prop_map(move |grants| GrantShape { users, grants })
    })
}

impl GrantShape {
    fn user(&self, u: usize) -> Value {
        database_user(&format!("u{u}"), &format!("user{u}"), &["10.0.0.1"])
    }

    fn database(&self, d: usize) -> Value {
        let users = (0..self.users)
            .filter(|u| self.grants[d][*u])
            .map(|u| self.user(u))
            .collect();
        database(&format!("d{d}"), &format!("db{d}"), users)
    }

    /// Every user scope lists the databases granting that user.
    fn catalog(&self) -> InMemoryCatalog {
        (0..self.users).fold(InMemoryCatalog::new(), |catalog, u| {
            let granting = (0..self.grants.len())
                .filter(|d| self.grants[*d][u])
                .map(|d| self.database(d))
                .collect();
            catalog.with_scoped("database", Scope::field("databaseUserId", format!("u{u}")), granting)
        })
    }
}

fn assert_unique(sequence: &[SequenceEntry]) -> Result<(), TestCaseError> {
    let mut seen = HashSet::new();
    for entry in sequence {
        prop_assert!(seen.insert(entry.key()), "duplicate entry {:?}", entry.key());
    }
    Ok(())
}

proptest! {
    #[test]
    fn website_dependencies_come_first_and_once(shape in website_strategy()) {
        let sequence = build_sequence("website", build_website(&shape), Action::Create);
        assert_unique(&sequence)?;

        let (primary, deps) = sequence.split_last().unwrap();
        prop_assert_eq!(primary.resource.identity(), "w1");
        prop_assert_eq!(primary.action, Action::Create);
        prop_assert!(deps.iter().all(|e| e.action == Action::Update && e.is_required_for()));

        let expected: HashSet<String> = shape
            .domains
            .iter()
            .flatten()
            .filter(|c| shape.certs_on[**c])
            .map(|c| format!("c{c}"))
            .chain(shape.account_on.then(|| "u1".to_string()))
            .collect();
        let got: HashSet<String> = deps.iter().map(|e| e.resource.identity().to_string()).collect();
        prop_assert_eq!(got, expected);

        // the account always precedes the certificates
        if shape.account_on {
            prop_assert_eq!(deps[0].resource.identity(), "u1");
        }
    }

    #[test]
    fn database_users_precede_their_database(
        users in proptest::collection::vec((0..5usize, any::<bool>()), 0..8),
    ) {
        let users: Vec<Value> = users
            .iter()
            .map(|(i, on)| switched(database_user(&format!("du{i}"), &format!("user{i}"), &["10.0.0.1"]), *on))
            .collect();
        let switched_on: HashSet<String> = users
            .iter()
            .filter(|u| u["switchedOn"] == json!(true))
            .map(|u| u["id"].as_str().unwrap().to_string())
            .collect();

        let sequence = build_sequence("database", database("db1", "db1", users), Action::Update);
        assert_unique(&sequence)?;

        let (primary, deps) = sequence.split_last().unwrap();
        prop_assert_eq!(primary.resource.identity(), "db1");
        prop_assert!(deps.iter().all(|e| e.res_type == "database-user"));
        let got: HashSet<String> = deps.iter().map(|e| e.resource.identity().to_string()).collect();
        prop_assert_eq!(got, switched_on);
    }

    #[test]
    fn side_effects_never_run_ahead_of_their_users(shape in grant_strategy()) {
        let sequence = build_sequence_with(shape.catalog(), "database", shape.database(0), Action::Update);
        assert_unique(&sequence)?;

        let pos = |id: &str| sequence.iter().position(|e| e.resource.identity() == id);
        prop_assert!(pos("d0").is_some());
        for entry in sequence.iter().filter(|e| e.res_type == "database") {
            let d: usize = entry.resource.identity()[1..].parse().unwrap();
            let at = pos(entry.resource.identity()).unwrap();
            for u in (0..shape.users).filter(|u| shape.grants[d][*u]) {
                if let Some(user_at) = pos(&format!("u{u}")) {
                    prop_assert!(user_at < at, "d{} placed before its user u{}", d, u);
                }
            }
        }
    }
}
