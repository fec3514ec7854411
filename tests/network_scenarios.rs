//! End-to-end scenarios driven over the real duplex transport: a raw TCP
//! client speaking the length-delimited envelope codec, exactly as an agent
//! would, against a `Network` bound to an OS-assigned port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use parley::config::NetworkConfig;
use parley::domain_types::{AgentId, ModName};
use parley::envelope::{Envelope, EnvelopeKind};
use parley::mods::ModHost;
use parley::orchestrator::Network;
use parley::transport::codec::EnvelopeCodec;

type Client = Framed<TcpStream, EnvelopeCodec>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_network(config: NetworkConfig) -> Arc<Network> {
    let mod_host = Arc::new(ModHost::build(&config));
    let network = Arc::new(Network::new(config, mod_host).expect("configuration is valid"));
    network.start().await.expect("network starts");
    network
}

async fn connect(network: &Network) -> Client {
    let addr: SocketAddr = network.local_addr().expect("listening after start");
    let stream = timeout(Duration::from_secs(1), TcpStream::connect(addr))
        .await
        .expect("connect did not time out")
        .expect("connect succeeds");
    Framed::new(stream, EnvelopeCodec::new(16 * 1024 * 1024))
}

async fn recv(client: &mut Client) -> Envelope {
    timeout(RECV_TIMEOUT, client.next())
        .await
        .expect("a response arrives before the timeout")
        .expect("the stream is not closed")
        .expect("the frame decodes as an envelope")
}

fn agent(s: &str) -> AgentId {
    AgentId::try_new(s.to_string()).unwrap()
}

fn thread_messaging() -> ModName {
    ModName::try_new("thread_messaging".to_string()).unwrap()
}

async fn register(client: &mut Client, agent_id: &str, force: bool) -> Value {
    let envelope = Envelope::new(
        EnvelopeKind::SystemRequest,
        agent(agent_id),
        json!({
            "command": "register_agent",
            "agent_id": agent_id,
            "force_reconnect": force,
        }),
    );
    client.send(envelope).await.expect("register frame sends");
    recv(client).await.payload
}

async fn mod_request(client: &mut Client, sender: &str, action: &str, mut fields: Value) -> Value {
    let map = fields.as_object_mut().expect("fields is an object");
    map.insert("action".to_string(), json!(action));
    let envelope = Envelope::new(EnvelopeKind::ModMessage, agent(sender), fields).with_mod(thread_messaging());
    client.send(envelope).await.expect("mod_message frame sends");
    recv(client).await.payload
}

/// S1 Registration collision: the first `register_agent{agent_id:"alpha"}`
/// succeeds, the second is rejected as `duplicate_agent`, and the directory
/// still shows exactly one "alpha" entry.
#[tokio::test]
async fn registration_collision_rejects_the_second_peer() {
    let network = start_network(NetworkConfig::testing()).await;

    let mut first = connect(&network).await;
    let response1 = register(&mut first, "alpha", false).await;
    assert_eq!(response1["success"], json!(true));

    let mut second = connect(&network).await;
    let response2 = register(&mut second, "alpha", false).await;
    assert_eq!(response2["success"], json!(false));
    assert_eq!(response2["error_kind"], json!("duplicate_agent"));

    assert_eq!(network.list_agents(None).len(), 1);
}

/// S2 DM routing: alpha's `send_direct_message` to beta is forwarded to
/// beta's own connection as a `direct` envelope carrying the same text,
/// sender, and thread level zero.
#[tokio::test]
async fn direct_message_is_routed_to_the_targets_own_peer() {
    let network = start_network(NetworkConfig::testing()).await;

    let mut alpha = connect(&network).await;
    register(&mut alpha, "alpha", false).await;
    let mut beta = connect(&network).await;
    register(&mut beta, "beta", false).await;

    let ack = mod_request(
        &mut alpha,
        "alpha",
        "send_direct_message",
        json!({"target_agent_id": "beta", "content": {"text": "hi"}}),
    )
    .await;
    assert_eq!(ack["success"], json!(true));
    assert_eq!(ack["message"]["content"]["text"], json!("hi"));
    assert_eq!(ack["message"]["thread_level"], json!(0));

    let pushed = recv(&mut beta).await;
    assert_eq!(pushed.kind, EnvelopeKind::Direct);
    assert_eq!(pushed.sender_id, agent("alpha"));
    assert_eq!(pushed.payload["message"]["content"]["text"], json!("hi"));
    assert_eq!(pushed.payload["message"]["sender"], json!("alpha"));
    assert_eq!(pushed.payload["message"]["thread_level"], json!(0));
}

/// S3 Reply chain: alpha posts a channel root, beta replies to it, gamma
/// replies to beta's reply; retrieving the channel with `include_threads`
/// yields the pre-order walk with the right levels and children counts.
#[tokio::test]
async fn reply_chain_reconstructs_in_pre_order() {
    let network = start_network(NetworkConfig::testing()).await;
    let mut client = connect(&network).await;
    register(&mut client, "alpha", false).await;

    let root_ack = mod_request(
        &mut client,
        "alpha",
        "send_channel_message",
        json!({"channel": "dev", "content": {"text": "Q?"}}),
    )
    .await;
    let root_id = root_ack["message"]["id"].as_str().unwrap().to_string();

    let r1_ack = mod_request(
        &mut client,
        "beta",
        "reply_message",
        json!({"reply_to_id": root_id, "content": {"text": "A1"}}),
    )
    .await;
    assert_eq!(r1_ack["message"]["thread_level"], json!(1));
    let r1_id = r1_ack["message"]["id"].as_str().unwrap().to_string();

    let r2_ack = mod_request(
        &mut client,
        "gamma",
        "reply_message",
        json!({"reply_to_id": r1_id, "content": {"text": "A2"}}),
    )
    .await;
    assert_eq!(r2_ack["message"]["thread_level"], json!(2));

    let retrieval = mod_request(
        &mut client,
        "alpha",
        "retrieve_channel_messages",
        json!({"channel": "dev", "limit": 10, "include_threads": true}),
    )
    .await;
    let messages = retrieval["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["content"]["text"], json!("Q?"));
    assert_eq!(messages[1]["content"]["text"], json!("A1"));
    assert_eq!(messages[2]["content"]["text"], json!("A2"));
    assert_eq!(messages[0]["thread_info"]["children_count"], json!(1));
    assert_eq!(messages[1]["thread_info"]["children_count"], json!(1));
    assert_eq!(messages[2]["thread_info"]["children_count"], json!(0));
}

/// S4 Depth cap: a reply chain up to level 5 succeeds; a further reply whose
/// parent is already at level 5 is rejected with `depth_exceeded`.
#[tokio::test]
async fn reply_past_the_structural_depth_cap_is_rejected() {
    let network = start_network(NetworkConfig::testing()).await;
    let mut client = connect(&network).await;
    register(&mut client, "alpha", false).await;

    let root_ack = mod_request(
        &mut client,
        "alpha",
        "send_channel_message",
        json!({"channel": "dev", "content": {"text": "root"}}),
    )
    .await;
    let mut current_id = root_ack["message"]["id"].as_str().unwrap().to_string();

    for level in 1..=5 {
        let ack = mod_request(
            &mut client,
            "alpha",
            "reply_message",
            json!({"reply_to_id": current_id, "content": {"text": format!("reply-{level}")}}),
        )
        .await;
        assert_eq!(ack["success"], json!(true));
        assert_eq!(ack["message"]["thread_level"], json!(level));
        current_id = ack["message"]["id"].as_str().unwrap().to_string();
    }

    let overflow = mod_request(
        &mut client,
        "alpha",
        "reply_message",
        json!({"reply_to_id": current_id, "content": {"text": "too deep"}}),
    )
    .await;
    assert_eq!(overflow["success"], json!(false));
    assert_eq!(overflow["error_kind"], json!("depth_exceeded"));
}

/// S5 Reaction toggle: adding the same reaction twice leaves the count at
/// one; removing drops it to zero; removing again (by someone who never
/// reacted) is a no-op.
#[tokio::test]
async fn reaction_toggle_is_idempotent() {
    let network = start_network(NetworkConfig::testing()).await;
    let mut client = connect(&network).await;
    register(&mut client, "alpha", false).await;

    let root_ack = mod_request(
        &mut client,
        "alpha",
        "send_channel_message",
        json!({"channel": "dev", "content": {"text": "hi"}}),
    )
    .await;
    let message_id = root_ack["message"]["id"].as_str().unwrap().to_string();

    let add1 = mod_request(
        &mut client,
        "beta",
        "reaction",
        json!({"target_message_id": message_id, "reaction_type": "like", "action_kind": "add"}),
    )
    .await;
    assert_eq!(add1["count"], json!(1));

    let add2 = mod_request(
        &mut client,
        "beta",
        "reaction",
        json!({"target_message_id": message_id, "reaction_type": "like", "action_kind": "add"}),
    )
    .await;
    assert_eq!(add2["count"], json!(1));

    let remove1 = mod_request(
        &mut client,
        "beta",
        "reaction",
        json!({"target_message_id": message_id, "reaction_type": "like", "action_kind": "remove"}),
    )
    .await;
    assert_eq!(remove1["count"], json!(0));

    let remove2 = mod_request(
        &mut client,
        "gamma",
        "reaction",
        json!({"target_message_id": message_id, "reaction_type": "like", "action_kind": "remove"}),
    )
    .await;
    assert_eq!(remove2["count"], json!(0));
}

/// S6 Heartbeat reap: a peer that never replies to heartbeats is removed
/// from the directory within a couple of heartbeat timeouts, and a
/// subsequent `list_agents` from another peer omits it.
#[tokio::test]
async fn silent_peer_is_reaped_after_missed_heartbeats() {
    let config = NetworkConfig::testing();
    assert_eq!(config.network.heartbeat_interval_secs, 1);
    let network = start_network(config).await;

    let mut beta = connect(&network).await;
    register(&mut beta, "beta", false).await;
    // `beta`'s connection stays open (dropping it would unbind immediately
    // via the reader task's EOF path, not the heartbeat-timeout path) but it
    // never reads again, so it never answers the heartbeats the node sends.

    assert_eq!(network.list_agents(None).len(), 1);
    tokio::time::sleep(Duration::from_millis(2_600)).await;
    assert_eq!(network.list_agents(None).len(), 0);

    let mut alpha = connect(&network).await;
    let response = register(&mut alpha, "alpha", false).await;
    assert_eq!(response["success"], json!(true));
    let agents = alpha_list_agents(&mut alpha).await;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["agent_id"], json!("alpha"));
}

async fn alpha_list_agents(client: &mut Client) -> Vec<Value> {
    let envelope = Envelope::new(
        EnvelopeKind::SystemRequest,
        agent("alpha"),
        json!({"command": "list_agents"}),
    );
    client.send(envelope).await.expect("list_agents frame sends");
    let payload = recv(client).await.payload;
    payload["agents"].as_array().cloned().unwrap_or_default()
}
