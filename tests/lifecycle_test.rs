//! Lifecycle manager flows against a mocked Discord REST API.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lycoris::discord::rest::{DiscordApi, GuildMember, User};
use lycoris::lifecycle::{InstanceManager, FAREWELL};
use lycoris::registry::SessionRegistry;

const GUILD: u64 = 1;
const BOT_ID: u64 = 999;
const CATEGORY_NAME: &str = "Instances Lycoris";

fn manager(server: &MockServer) -> (Arc<InstanceManager>, Arc<Mutex<SessionRegistry>>) {
    let api = Arc::new(DiscordApi::with_base(&server.uri(), "token"));
    let registry = Arc::new(Mutex::new(SessionRegistry::new("persona", 12)));
    let manager = Arc::new(InstanceManager::new(
        api,
        registry.clone(),
        CATEGORY_NAME,
        BOT_ID,
    ));
    (manager, registry)
}

fn requester(id: u64, nick: &str) -> GuildMember {
    GuildMember {
        user: User {
            id,
            username: "marie".to_string(),
            global_name: None,
            bot: false,
        },
        nick: Some(nick.to_string()),
        roles: vec![],
    }
}

fn category_json() -> serde_json::Value {
    json!({ "id": "10", "type": 4, "name": CATEGORY_NAME })
}

fn human_member_json(id: u64, nick: &str) -> serde_json::Value {
    json!({
        "user": { "id": id.to_string(), "username": "marie", "bot": false },
        "nick": nick,
        "roles": []
    })
}

fn bot_message_json() -> serde_json::Value {
    json!({
        "id": "900",
        "author": { "id": BOT_ID.to_string(), "username": "lycoris", "bot": true },
        "content": "ok",
        "pinned": false
    })
}

#[tokio::test]
async fn create_instance_builds_channel_and_registers_owner() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("/guilds/{GUILD}/channels")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([category_json()])))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("/guilds/{GUILD}/channels")))
        .and(body_partial_json(json!({ "type": 0, "name": "lycoris-marie" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "30", "type": 0, "name": "lycoris-marie", "parent_id": "10"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/channels/30"))
        .and(body_partial_json(json!({ "topic": "lyc-owner:100" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/channels/30/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bot_message_json()))
        .expect(1)
        .mount(&server)
        .await;

    let (manager, registry) = manager(&server);
    let created = manager
        .create_instance(GUILD, &requester(100, "Marie"))
        .await
        .unwrap();

    let channel = created.expect("instance should be created");
    assert_eq!(channel.id, 30);

    let registry = registry.lock().await;
    assert_eq!(registry.owner_of(30), Some(100));
    assert_eq!(registry.sessions_of(100), &[30]);
    assert_eq!(registry.count_live_sessions(), 1);
}

#[tokio::test]
async fn create_instance_deduplicates_channel_name() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("/guilds/{GUILD}/channels")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            category_json(),
            { "id": "20", "type": 0, "name": "lycoris-marie", "parent_id": "10" }
        ])))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("/guilds/{GUILD}/channels")))
        .and(body_partial_json(json!({ "type": 0, "name": "lycoris-marie-2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "31", "type": 0, "name": "lycoris-marie-2", "parent_id": "10"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/channels/31"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/channels/31/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bot_message_json()))
        .mount(&server)
        .await;

    let (manager, _) = manager(&server);
    let created = manager
        .create_instance(GUILD, &requester(100, "Marie"))
        .await
        .unwrap();
    assert_eq!(created.unwrap().name(), "lycoris-marie-2");
}

#[tokio::test]
async fn create_instance_refused_at_cap_without_host_calls() {
    let server = MockServer::start().await;
    let (manager, registry) = manager(&server);

    {
        let mut reg = registry.lock().await;
        reg.set_owner(20, 100).unwrap();
        reg.set_owner(21, 100).unwrap();
    }

    let created = manager
        .create_instance(GUILD, &requester(100, "Marie"))
        .await
        .unwrap();
    assert!(created.is_none());

    let registry = registry.lock().await;
    assert_eq!(registry.sessions_of(100), &[20, 21]);
    assert_eq!(registry.count_live_sessions(), 2);
}

#[tokio::test]
async fn close_instance_cleans_registry_even_when_host_refuses() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/channels/20/messages"))
        .respond_with(ResponseTemplate::new(403).set_body_string("Missing Permissions"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/channels/20"))
        .respond_with(ResponseTemplate::new(403).set_body_string("Missing Permissions"))
        .mount(&server)
        .await;

    let (manager, registry) = manager(&server);
    registry.lock().await.set_owner(20, 100).unwrap();

    manager.close_instance(20, FAREWELL).await;

    let registry = registry.lock().await;
    assert!(!registry.is_tracked(20));
    assert!(registry.sessions_of(100).is_empty());
    assert_eq!(registry.count_live_sessions(), 0);
}

#[tokio::test]
async fn rehydrate_prefers_topic_tag_over_overwrites() {
    let server = MockServer::start().await;

    // Topic names owner 100; overwrites point at a different human (200).
    Mock::given(method("GET"))
        .and(path(format!("/guilds/{GUILD}/channels")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            category_json(),
            {
                "id": "20", "type": 0, "name": "lycoris-marie", "parent_id": "10",
                "topic": "lyc-owner:100",
                "permission_overwrites": [
                    { "id": "200", "type": 1, "allow": "1024", "deny": "0" }
                ]
            }
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/guilds/{GUILD}/members/100")))
        .respond_with(ResponseTemplate::new(200).set_body_json(human_member_json(100, "Marie")))
        .expect(1)
        .mount(&server)
        .await;

    let (manager, registry) = manager(&server);
    let restored = manager.rehydrate_guild(GUILD).await.unwrap();
    assert_eq!(restored, 1);
    assert_eq!(registry.lock().await.owner_of(20), Some(100));

    // Idempotent: a second pass restores nothing new.
    let restored_again = manager.rehydrate_guild(GUILD).await.unwrap();
    assert_eq!(restored_again, 0);
    assert_eq!(registry.lock().await.count_live_sessions(), 1);
}

#[tokio::test]
async fn rehydrate_falls_back_to_overwrites_and_repairs_topic() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("/guilds/{GUILD}/channels")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            category_json(),
            {
                "id": "20", "type": 0, "name": "lycoris-marie", "parent_id": "10",
                "permission_overwrites": [
                    { "id": BOT_ID.to_string(), "type": 1, "allow": "1024", "deny": "0" },
                    { "id": "200", "type": 1, "allow": "1024", "deny": "0" }
                ]
            }
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/guilds/{GUILD}/members/200")))
        .respond_with(ResponseTemplate::new(200).set_body_json(human_member_json(200, "Marie")))
        .mount(&server)
        .await;

    // Topic repair attempt is best-effort; a 403 must not block restoration.
    Mock::given(method("PATCH"))
        .and(path("/channels/20"))
        .and(body_partial_json(json!({ "topic": "lyc-owner:200" })))
        .respond_with(ResponseTemplate::new(403).set_body_string("Missing Permissions"))
        .expect(1)
        .mount(&server)
        .await;

    let (manager, registry) = manager(&server);
    let restored = manager.rehydrate_guild(GUILD).await.unwrap();
    assert_eq!(restored, 1);
    assert_eq!(registry.lock().await.owner_of(20), Some(200));
}

#[tokio::test]
async fn rehydrate_skips_channel_without_resolvable_owner() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("/guilds/{GUILD}/channels")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            category_json(),
            { "id": "20", "type": 0, "name": "lycoris-fantome", "parent_id": "10" }
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/guilds/{GUILD}/members")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/channels/20/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let (manager, registry) = manager(&server);
    let restored = manager.rehydrate_guild(GUILD).await.unwrap();
    assert_eq!(restored, 0);
    assert!(!registry.lock().await.is_tracked(20));
}

#[tokio::test]
async fn rehydrate_resolves_owner_from_history() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("/guilds/{GUILD}/channels")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            category_json(),
            { "id": "20", "type": 0, "name": "lycoris-marie", "parent_id": "10" }
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/guilds/{GUILD}/members")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    // Newest first: a bot message, then a human one.
    Mock::given(method("GET"))
        .and(path("/channels/20/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "id": "902",
                "author": { "id": BOT_ID.to_string(), "username": "lycoris", "bot": true },
                "content": "bonjour", "pinned": false
            },
            {
                "id": "901",
                "author": { "id": "100", "username": "marie", "bot": false },
                "content": "salut", "pinned": false
            }
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/guilds/{GUILD}/members/100")))
        .respond_with(ResponseTemplate::new(200).set_body_json(human_member_json(100, "Marie")))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/channels/20"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (manager, registry) = manager(&server);
    let restored = manager.rehydrate_guild(GUILD).await.unwrap();
    assert_eq!(restored, 1);
    assert_eq!(registry.lock().await.owner_of(20), Some(100));
}
