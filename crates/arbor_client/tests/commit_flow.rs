//! Commit protocol flows without reconnect interference.

mod common;

use std::collections::BTreeMap;

use arbor_access::{
    PersistenceProtocol, RequestError, RequestPayload, Response, TreeOperation, TreePath,
};
use arbor_client::proxy::{ProxyError, VotingFuture};

use common::{node, path, remote_proxy, snapshot_proxy, tx, ParentEvent, RecordingParent};

#[tokio::test]
async fn read_write_then_direct_commit() {
    let parent = RecordingParent::new();
    let proxy = remote_proxy(&parent, 1);

    let read = proxy.read(&path("a")).unwrap();
    let answered = parent.respond(Response::ReadSuccess {
        data: Some(node(b"v")),
    });
    assert!(matches!(answered.payload, RequestPayload::Read { .. }));
    assert_eq!(read.await.unwrap(), Ok(Some(node(b"v"))));

    proxy.write(&path("a"), node(b"v2")).unwrap();
    proxy.seal().unwrap();

    let committed = proxy.direct_commit().unwrap();
    let commit = parent.respond(Response::CommitSuccess);
    match commit.payload {
        RequestPayload::Modify {
            operations,
            protocol,
        } => {
            assert_eq!(
                operations,
                vec![TreeOperation::Write {
                    path: path("a"),
                    data: node(b"v2"),
                }]
            );
            assert_eq!(protocol, PersistenceProtocol::Simple);
        }
        other => panic!("unexpected commit request: {other:?}"),
    }
    assert_eq!(committed.await.unwrap(), Ok(true));

    let purge = parent.respond(Response::PurgeSuccess);
    assert_eq!(purge.payload, RequestPayload::Purge);
    assert_eq!(
        parent.events(),
        vec![ParentEvent::Sealed(tx(1)), ParentEvent::Completed(tx(1))]
    );
}

#[test]
fn second_seal_fails_but_commit_proceeds() {
    let parent = RecordingParent::new();
    let proxy = remote_proxy(&parent, 1);
    proxy.write(&path("a"), node(b"v")).unwrap();

    proxy.seal().unwrap();
    assert_eq!(proxy.seal(), Err(ProxyError::DoubleSeal(tx(1))));

    let mut committed = proxy.direct_commit().unwrap();
    parent.respond(Response::CommitSuccess);
    assert_eq!(committed.try_recv().unwrap(), Ok(true));
}

#[test]
fn request_sequences_are_strictly_increasing() {
    let parent = RecordingParent::new();
    let proxy = remote_proxy(&parent, 1);

    let _ = proxy.read(&path("a")).unwrap();
    let _ = proxy.exists(&path("b")).unwrap();
    proxy.write(&path("a"), node(b"v")).unwrap();
    proxy.seal().unwrap();
    let _ = proxy.direct_commit().unwrap();

    let mut sequences = Vec::new();
    sequences.push(
        parent
            .respond(Response::ReadSuccess { data: None })
            .sequence,
    );
    sequences.push(
        parent
            .respond(Response::ExistsSuccess { present: false })
            .sequence,
    );
    sequences.push(parent.respond(Response::CommitSuccess).sequence);
    sequences.push(parent.respond(Response::PurgeSuccess).sequence);

    assert!(
        sequences.windows(2).all(|pair| pair[0] < pair[1]),
        "sequences not strictly increasing: {sequences:?}"
    );
}

#[test]
fn three_phase_commit_completes_and_purges_once() {
    let parent = RecordingParent::new();
    let proxy = remote_proxy(&parent, 1);
    proxy.write(&path("a"), node(b"v")).unwrap();
    proxy.seal().unwrap();

    let (voting, mut decision) = VotingFuture::new(1);
    proxy.can_commit(&voting).unwrap();
    let request = parent.respond(Response::CanCommitSuccess);
    match request.payload {
        RequestPayload::Modify { protocol, .. } => {
            assert_eq!(protocol, PersistenceProtocol::ThreePhase)
        }
        other => panic!("unexpected can-commit request: {other:?}"),
    }
    assert_eq!(decision.try_recv().unwrap(), Ok(()));

    let (voting, mut decision) = VotingFuture::new(1);
    proxy.pre_commit(&voting).unwrap();
    let request = parent.respond(Response::PreCommitSuccess);
    assert_eq!(request.payload, RequestPayload::PreCommit);
    assert_eq!(decision.try_recv().unwrap(), Ok(()));

    let (voting, mut decision) = VotingFuture::new(1);
    proxy.do_commit(&voting).unwrap();
    let request = parent.respond(Response::CommitSuccess);
    assert_eq!(request.payload, RequestPayload::DoCommit);
    assert_eq!(decision.try_recv().unwrap(), Ok(()));

    // do_commit completion triggers the one and only purge.
    let purge = parent.respond(Response::PurgeSuccess);
    assert_eq!(purge.payload, RequestPayload::Purge);
    proxy.purge();
    assert_eq!(parent.queue_len(), 0);
    assert_eq!(
        parent.events(),
        vec![ParentEvent::Sealed(tx(1)), ParentEvent::Completed(tx(1))]
    );
}

#[test]
fn direct_commit_failure_carries_cause_and_still_purges() {
    let parent = RecordingParent::new();
    let proxy = remote_proxy(&parent, 1);
    proxy.write(&path("a"), node(b"v")).unwrap();
    proxy.seal().unwrap();

    let mut committed = proxy.direct_commit().unwrap();
    parent.respond(Response::Failure(RequestError::new("backend unavailable")));
    assert_eq!(
        committed.try_recv().unwrap(),
        Err(ProxyError::CommitFailed(RequestError::new(
            "backend unavailable"
        )))
    );

    let purge = parent.respond(Response::PurgeSuccess);
    assert_eq!(purge.payload, RequestPayload::Purge);
}

#[test]
fn unrelated_response_to_do_commit_is_a_protocol_violation() {
    let parent = RecordingParent::new();
    let proxy = remote_proxy(&parent, 1);
    proxy.write(&path("a"), node(b"v")).unwrap();
    proxy.seal().unwrap();

    let (voting, _decision) = VotingFuture::new(1);
    proxy.can_commit(&voting).unwrap();
    parent.respond(Response::CanCommitSuccess);

    let (voting, mut decision) = VotingFuture::new(1);
    proxy.do_commit(&voting).unwrap();
    parent.respond(Response::ReadSuccess { data: None });
    assert!(matches!(
        decision.try_recv().unwrap(),
        Err(ProxyError::ProtocolViolation(_))
    ));

    // The vote was no, but the transaction is still purged.
    let purge = parent.respond(Response::PurgeSuccess);
    assert_eq!(purge.payload, RequestPayload::Purge);
    assert_eq!(parent.events().last(), Some(&ParentEvent::Completed(tx(1))));
}

#[test]
fn sealed_abort_votes_and_purges() {
    let parent = RecordingParent::new();
    let proxy = remote_proxy(&parent, 1);
    proxy.seal().unwrap();

    let (voting, mut decision) = VotingFuture::new(1);
    proxy.abort_voting(&voting).unwrap();
    let request = parent.respond(Response::AbortSuccess);
    assert_eq!(request.payload, RequestPayload::Abort);
    assert_eq!(decision.try_recv().unwrap(), Ok(()));

    let purge = parent.respond(Response::PurgeSuccess);
    assert_eq!(purge.payload, RequestPayload::Purge);
}

#[test]
fn snapshot_proxy_reads_and_aborts() {
    let parent = RecordingParent::new();
    let mut snapshot = BTreeMap::new();
    snapshot.insert(path("a"), node(b"base"));
    let proxy = snapshot_proxy(&parent, 1, snapshot);

    let mut read = proxy.read(&path("a")).unwrap();
    assert_eq!(read.try_recv().unwrap(), Ok(Some(node(b"base"))));
    let mut missing = proxy.exists(&TreePath::new(["zzz"])).unwrap();
    assert_eq!(missing.try_recv().unwrap(), Ok(false));

    assert_eq!(
        proxy.write(&path("a"), node(b"nope")),
        Err(ProxyError::ReadOnlyViolation(tx(1)))
    );

    proxy.abort().unwrap();
    let abort = parent.respond(Response::AbortSuccess);
    assert_eq!(abort.payload, RequestPayload::Abort);
    assert_eq!(parent.events(), vec![ParentEvent::Aborted(tx(1))]);
}

#[test]
fn read_failure_surfaces_through_the_future() {
    let parent = RecordingParent::new();
    let proxy = remote_proxy(&parent, 1);

    let mut read = proxy.read(&path("a")).unwrap();
    parent.respond(Response::Failure(RequestError::new("leader moved")));
    assert_eq!(
        read.try_recv().unwrap(),
        Err(ProxyError::ReadFailed(RequestError::new("leader moved")))
    );
}
