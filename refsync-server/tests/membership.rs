//! Membership acceptance tests: instance creation, invitations, join
//! codes, revocation, and the signed-request gate.

mod common;

use common::{SKU, admit_peer, api, create_instance, start_server};
use refsync_sdk::error::Error;
use refsync_sdk::identity::Keypair;
use refsync_sdk::records::{Incident, Outcome};

#[tokio::test]
async fn creator_gets_an_accepted_admin_invitation() {
    let addr = start_server().await;
    let keypair = Keypair::generate();
    let client = api(addr, &keypair);
    client.register_user("head ref").await.unwrap();

    let invitation = client.create_instance(SKU).await.unwrap();
    assert!(invitation.accepted);
    assert!(invitation.admin);
    assert_eq!(invitation.to, keypair.peer_id());
    assert!(invitation.instance_secret.is_some());

    // Reading it back keeps the secret attached.
    let read = client.invitation(SKU).await.unwrap().unwrap();
    assert!(read.accepted);
    assert_eq!(read.instance_secret, invitation.instance_secret);

    // Creating the same instance twice is refused.
    assert!(client.create_instance(SKU).await.is_err());
}

#[tokio::test]
async fn invitation_is_pending_until_accepted_and_consumed_once() {
    let addr = start_server().await;
    let (_admin_kp, admin) = create_instance(addr).await;

    let target_kp = Keypair::generate();
    let target = api(addr, &target_kp);
    target.register_user("line ref").await.unwrap();

    // No invitation yet.
    assert!(target.invitation(SKU).await.unwrap().is_none());

    admin.invite(SKU, &target_kp.peer_id(), false).await.unwrap();
    let pending = target.invitation(SKU).await.unwrap().unwrap();
    assert!(!pending.accepted);
    assert!(pending.instance_secret.is_none(), "secret must not leak before acceptance");

    let accepted = target.accept(SKU, &pending.id).await.unwrap();
    assert!(accepted.accepted);
    assert!(accepted.instance_secret.is_some());

    // Accepting twice fails: consumed exactly once.
    assert!(target.accept(SKU, &pending.id).await.is_err());
}

#[tokio::test]
async fn only_the_invitee_can_accept() {
    let addr = start_server().await;
    let (_admin_kp, admin) = create_instance(addr).await;

    let target_kp = Keypair::generate();
    admin.invite(SKU, &target_kp.peer_id(), false).await.unwrap();
    let pending = api(addr, &target_kp).invitation(SKU).await.unwrap().unwrap();

    let interloper = api(addr, &Keypair::generate());
    assert!(matches!(
        interloper.accept(SKU, &pending.id).await,
        Err(Error::Forbidden)
    ));
}

#[tokio::test]
async fn non_admin_cannot_invite() {
    let addr = start_server().await;
    let (_admin_kp, admin) = create_instance(addr).await;
    let (_member_kp, member) = admit_peer(addr, &admin, "line ref").await;

    let someone = Keypair::generate();
    assert!(matches!(
        member.invite(SKU, &someone.peer_id(), false).await,
        Err(Error::Forbidden)
    ));
}

#[tokio::test]
async fn request_code_resolves_for_admins_only() {
    let addr = start_server().await;
    let (_admin_kp, admin) = create_instance(addr).await;

    let requester_kp = Keypair::generate();
    let requester = api(addr, &requester_kp);
    let code = requester.request_code(SKU).await.unwrap();
    assert_eq!(code.len(), 6);

    // The admin reads the code off the requester's screen.
    let resolved = admin.resolve_code(SKU, &code).await.unwrap();
    assert_eq!(resolved, requester_kp.peer_id());

    // A wrong code does not resolve.
    assert!(matches!(
        admin.resolve_code(SKU, "ZZZZZZ").await,
        Err(Error::IncorrectCode)
    ));

    // A non-admin cannot resolve codes.
    assert!(matches!(
        requester.resolve_code(SKU, &code).await,
        Err(Error::Forbidden)
    ));
}

#[tokio::test]
async fn revoked_peer_loses_write_access() {
    let addr = start_server().await;
    let (_admin_kp, admin) = create_instance(addr).await;
    let (member_kp, member) = admit_peer(addr, &admin, "line ref").await;

    // Sanity: the member can write.
    let incident = Incident::new(SKU, "1234A", Outcome::Minor);
    let envelope = refsync_sdk::consistency::Envelope::new(incident, &member_kp.peer_id());
    member.put_incident(SKU, &envelope).await.unwrap();

    admin.revoke(SKU, &member_kp.peer_id()).await.unwrap();

    let incident = Incident::new(SKU, "5678B", Outcome::Major);
    let envelope = refsync_sdk::consistency::Envelope::new(incident, &member_kp.peer_id());
    assert!(matches!(member.put_incident(SKU, &envelope).await, Err(Error::Forbidden)));
    assert!(member.invitation(SKU).await.unwrap().is_none());
}

#[tokio::test]
async fn the_last_admin_cannot_be_removed() {
    let addr = start_server().await;
    let (admin_kp, admin) = create_instance(addr).await;
    assert!(admin.revoke(SKU, &admin_kp.peer_id()).await.is_err());

    // Still an admin afterwards.
    admin.invite(SKU, &Keypair::generate().peer_id(), false).await.unwrap();
}

#[tokio::test]
async fn members_can_remove_themselves() {
    let addr = start_server().await;
    let (_admin_kp, admin) = create_instance(addr).await;
    let (member_kp, member) = admit_peer(addr, &admin, "line ref").await;

    member.revoke(SKU, &member_kp.peer_id()).await.unwrap();
    assert!(matches!(member.snapshot(SKU).await, Err(Error::Forbidden)));
}

#[tokio::test]
async fn unsigned_requests_are_rejected() {
    let addr = start_server().await;
    let (_admin_kp, _admin) = create_instance(addr).await;

    let raw = reqwest::Client::new();
    let resp = raw.get(format!("http://{addr}/api/{SKU}/get")).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["reason"], "bad_signature");
}

#[tokio::test]
async fn non_members_cannot_read_snapshots() {
    let addr = start_server().await;
    let (_admin_kp, _admin) = create_instance(addr).await;

    let outsider = api(addr, &Keypair::generate());
    assert!(matches!(outsider.snapshot(SKU).await, Err(Error::Forbidden)));
}
