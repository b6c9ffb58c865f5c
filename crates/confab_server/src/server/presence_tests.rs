#![forbid(unsafe_code)]

use confab_domain::Username;

use crate::server::presence::PresenceRegistry;

fn user(name: &str) -> Username {
	Username::new(name).expect("valid username")
}

#[tokio::test]
async fn register_binds_identity_to_connection() {
	let registry = PresenceRegistry::new();

	let outcome = registry.register(7, user("alice")).await;
	assert_eq!(outcome.displaced_conn, None);
	assert_eq!(outcome.replaced_identity, None);

	assert_eq!(registry.identity_of(7).await, Some(user("alice")));
	assert_eq!(registry.snapshot_excluding(None).await, vec!["alice".to_string()]);
}

#[tokio::test]
async fn later_claim_displaces_earlier_connection() {
	let registry = PresenceRegistry::new();

	registry.register(1, user("alice")).await;
	let outcome = registry.register(2, user("alice")).await;

	assert_eq!(outcome.displaced_conn, Some(1));
	assert_eq!(registry.identity_of(1).await, None, "displaced connection owns nothing");
	assert_eq!(registry.identity_of(2).await, Some(user("alice")));

	// The orphaned connection's deregister must not disturb the new owner.
	assert_eq!(registry.deregister(1).await, None);
	assert_eq!(registry.identity_of(2).await, Some(user("alice")));
	assert_eq!(registry.snapshot_excluding(None).await, vec!["alice".to_string()]);
}

#[tokio::test]
async fn reclaiming_a_new_identity_releases_the_old_one() {
	let registry = PresenceRegistry::new();

	registry.register(3, user("alice")).await;
	let outcome = registry.register(3, user("alpha")).await;

	assert_eq!(outcome.displaced_conn, None);
	assert_eq!(outcome.replaced_identity, Some(user("alice")));
	assert_eq!(registry.identity_of(3).await, Some(user("alpha")));
	assert_eq!(registry.snapshot_excluding(None).await, vec!["alpha".to_string()]);
}

#[tokio::test]
async fn deregister_releases_only_the_live_owner() {
	let registry = PresenceRegistry::new();

	registry.register(1, user("alice")).await;
	registry.register(2, user("bob")).await;

	assert_eq!(registry.deregister(1).await, Some(user("alice")));
	assert_eq!(registry.deregister(1).await, None, "second deregister is a no-op");
	assert_eq!(registry.snapshot_excluding(None).await, vec!["bob".to_string()]);
}

#[tokio::test]
async fn snapshot_is_sorted_and_excludes_the_caller() {
	let registry = PresenceRegistry::new();

	registry.register(1, user("carol")).await;
	registry.register(2, user("alice")).await;
	registry.register(3, user("bob")).await;

	let all = registry.snapshot_excluding(None).await;
	assert_eq!(all, vec!["alice".to_string(), "bob".to_string(), "carol".to_string()]);

	let visible = registry.snapshot_excluding(Some(&user("bob"))).await;
	assert_eq!(visible, vec!["alice".to_string(), "carol".to_string()]);
}

#[tokio::test]
async fn roster_tailors_the_view_per_connection() {
	let registry = PresenceRegistry::new();

	registry.register(1, user("alice")).await;
	registry.register(2, user("bob")).await;

	let roster = registry.roster().await;
	assert_eq!(roster.online(), &["alice".to_string(), "bob".to_string()]);
	assert_eq!(roster.visible_to(1), vec!["bob".to_string()]);
	assert_eq!(roster.visible_to(2), vec!["alice".to_string()]);

	// A connection that has not claimed yet sees everyone.
	assert_eq!(roster.visible_to(99), vec!["alice".to_string(), "bob".to_string()]);
}
