//! 重连端到端测试：教学方在独立线程上服务，学习方在测试线程上运行

mod common;

use std::thread;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use virtual_map::hash::digest_leaf;
use virtual_map::map::generation_dir;
use virtual_map::reconnect::{Request, RequestBody, Response, ResponseBody};
use virtual_map::{
    memory_channel, Blake3Hasher, Channel, MapError, ReconnectOutcome, Role, VirtualMap,
    VirtualNode, NULL_HASH,
};

use common::*;

/// 以 `teacher` 的当前状态重连 `learner`
fn reconnect(teacher: &mut VirtualMap, learner: &mut VirtualMap) -> ReconnectOutcome {
    let (teacher_end, learner_end, _link) = memory_channel();
    let mut serving = teacher.teacher().unwrap();
    let handle = thread::spawn(move || serving.serve(teacher_end));
    let outcome = learner.start_reconnect(Role::Learner, learner_end).unwrap();
    handle.join().unwrap().unwrap();
    outcome
}

fn assert_converged(teacher: &VirtualMap, learner: &VirtualMap) {
    assert_eq!(learner.len(), teacher.len());
    assert_eq!(contents(learner), contents(teacher));
    assert_eq!(leaves(learner), leaves(teacher));
    assert_eq!(learner.root_hash().unwrap(), teacher.root_hash().unwrap());
}

/// 测试：空学习方从 1..=1000（删除 500..=600）的教学方完整同步
#[test]
fn test_empty_learner_receives_everything() {
    init_logger();
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    fill(&mut teacher, 1..=1000);
    let h1 = teacher.root_hash().unwrap();
    let before = teacher.copy().unwrap();
    for i in 500..=600 {
        teacher.remove(&key(i)).unwrap();
    }
    let h2 = teacher.root_hash().unwrap();
    assert_ne!(h1, h2);
    assert_eq!(before.root_hash().unwrap(), h1);
    let mut learner = open_map(&learner_dir);

    let outcome = reconnect(&mut teacher, &mut learner);
    assert_eq!(outcome, ReconnectOutcome::Success { root_hash: h2 });
    assert_converged(&teacher, &learner);
    assert_eq!(learner.generation(), 1);
    for i in 1..=1000 {
        let expected = !(500..=600).contains(&i);
        assert_eq!(learner.contains_key(&key(i)), expected, "key {}", i);
    }

    let stats = learner.last_reconnect_stats();
    assert_eq!(stats.leaves_transferred, 899);
    assert_eq!(stats.leaves_reused, 0);
    assert_eq!(stats.hash_requests, 0);
}

/// 测试：key 集合部分重叠、value 不同的两棵树收敛
#[test]
fn test_overlapping_maps_converge() {
    init_logger();
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    let mut learner = open_map(&learner_dir);

    fill(&mut teacher, 0..400);
    for i in (0..400).step_by(9) {
        teacher.remove(&key(i)).unwrap();
    }
    for i in 200..600 {
        learner.put(&key(i), format!("stale-{}", i).as_bytes()).unwrap();
    }

    let outcome = reconnect(&mut teacher, &mut learner);
    assert!(outcome.is_success(), "{:?}", outcome);
    assert_converged(&teacher, &learner);
    assert_eq!(learner.get(&key(450)).unwrap(), None);
}

/// 测试：只有一个 value 不同时只传输一个叶子
#[test]
fn test_single_difference_transfers_one_leaf() {
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    let mut learner = open_map(&learner_dir);
    fill(&mut teacher, 0..200);
    fill(&mut learner, 0..200);
    teacher.put(&key(77), b"fresh").unwrap();

    let outcome = reconnect(&mut teacher, &mut learner);
    assert!(outcome.is_success());
    assert_converged(&teacher, &learner);
    assert_eq!(learner.get(&key(77)).unwrap(), Some(b"fresh".to_vec()));

    let stats = learner.last_reconnect_stats();
    assert_eq!(stats.leaves_transferred, 1);
    assert_eq!(stats.leaves_reused, 199);
    assert!(stats.subtrees_reused > 0);
}

/// 测试：完全相同的树只比较一次 root hash
#[test]
fn test_identical_maps_reuse_everything() {
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    let mut learner = open_map(&learner_dir);
    fill(&mut teacher, 0..128);
    fill(&mut learner, 0..128);

    let outcome = reconnect(&mut teacher, &mut learner);
    assert!(outcome.is_success());
    assert_converged(&teacher, &learner);

    let stats = learner.last_reconnect_stats();
    assert_eq!(stats.hash_requests, 1);
    assert_eq!(stats.node_requests, 0);
    assert_eq!(stats.leaves_transferred, 0);
    assert_eq!(stats.leaves_reused, 128);
}

/// 测试：空教学方让学习方变空
#[test]
fn test_empty_teacher_empties_learner() {
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    let mut learner = open_map(&learner_dir);
    fill(&mut learner, 0..30);

    let outcome = reconnect(&mut teacher, &mut learner);
    assert_eq!(outcome, ReconnectOutcome::Success { root_hash: NULL_HASH });
    assert!(learner.is_empty());
    assert_eq!(learner.root_hash().unwrap(), NULL_HASH);
}

/// 测试：教学方服务的是创建时的快照，之后的修改不会被传输
#[test]
fn test_teacher_serves_frozen_snapshot() {
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    let mut learner = open_map(&learner_dir);
    fill(&mut teacher, 0..100);

    let (teacher_end, learner_end, _link) = memory_channel();
    let mut serving = teacher.teacher().unwrap();
    let expected = contents(&teacher);
    let expected_root = teacher.root_hash().unwrap();
    fill(&mut teacher, 100..150);
    teacher.remove(&key(3)).unwrap();

    let handle = thread::spawn(move || serving.serve(teacher_end));
    let outcome = learner.start_reconnect(Role::Learner, learner_end).unwrap();
    handle.join().unwrap().unwrap();

    assert_eq!(outcome, ReconnectOutcome::Success { root_hash: expected_root });
    assert_eq!(contents(&learner), expected);
}

/// 测试：两端都通过 start_reconnect 进入会话
#[test]
fn test_start_reconnect_both_roles() {
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    let mut learner = open_map(&learner_dir);
    fill(&mut teacher, 0..64);
    fill(&mut learner, 32..96);

    let (teacher_end, learner_end, _link) = memory_channel();
    let (teacher_outcome, learner_outcome) = thread::scope(|scope| {
        let serving = scope.spawn(|| teacher.start_reconnect(Role::Teacher, teacher_end));
        let learned = learner.start_reconnect(Role::Learner, learner_end).unwrap();
        (serving.join().unwrap().unwrap(), learned)
    });

    assert!(teacher_outcome.is_success());
    assert!(learner_outcome.is_success());
    assert_converged(&teacher, &learner);
    assert!(teacher.last_reconnect_stats().requests_answered > 0);
}

/// 测试：成功的重连在重新打开后依然生效，旧一代目录被删除
#[test]
fn test_reconnected_state_survives_reopen() {
    init_logger();
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    fill(&mut teacher, 0..300);
    let mut learner = open_map(&learner_dir);
    fill(&mut learner, 1000..1010);
    learner.sync().unwrap();

    assert!(reconnect(&mut teacher, &mut learner).is_success());
    teacher.remove(&key(5)).unwrap();
    assert!(reconnect(&mut teacher, &mut learner).is_success());
    assert_eq!(learner.generation(), 2);

    let expected = contents(&learner);
    let root = learner.root_hash().unwrap();
    learner.close().unwrap();

    let data_dir = test_config(&learner_dir).data_dir;
    assert!(!generation_dir(&data_dir, 0).exists());
    assert!(!generation_dir(&data_dir, 1).exists());
    assert!(generation_dir(&data_dir, 2).exists());

    let reopened = open_map(&learner_dir);
    assert_eq!(reopened.generation(), 2);
    assert_eq!(contents(&reopened), expected);
    assert_eq!(reopened.root_hash().unwrap(), root);
}

fn assert_untouched(learner: &VirtualMap, dir: &TempDir, expected: &[(Vec<u8>, Vec<u8>)], root: [u8; 32]) {
    assert_eq!(leaves(learner), expected);
    assert_eq!(learner.root_hash().unwrap(), root);
    assert_eq!(learner.generation(), 0);
    let data_dir = test_config(dir).data_dir;
    assert!(!generation_dir(&data_dir, 1).exists());
}

/// 测试：链路中途断开，学习方得到 Cancelled 且状态不变
#[test]
fn test_severed_link_cancels() {
    init_logger();
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    fill(&mut teacher, 0..500);
    let mut learner = open_map(&learner_dir);
    fill(&mut learner, 250..300);
    let before = leaves(&learner);
    let root = learner.root_hash().unwrap();

    let (teacher_end, learner_end, link) = memory_channel();
    link.sever_after(40);
    let mut serving = teacher.teacher().unwrap();
    let handle = thread::spawn(move || serving.serve(teacher_end));
    let outcome = learner.start_reconnect(Role::Learner, learner_end).unwrap();
    let teacher_outcome = handle.join().unwrap().unwrap();

    assert_eq!(outcome, ReconnectOutcome::Cancelled);
    assert!(!teacher_outcome.is_success());
    assert!(link.is_severed());
    assert_untouched(&learner, &learner_dir, &before, root);

    // 之后的重连仍然可以成功
    assert!(reconnect(&mut teacher, &mut learner).is_success());
    assert_converged(&teacher, &learner);
}

/// 测试：应答停止到达，学习方在期限后得到 Timeout
#[test]
fn test_stalled_link_times_out() {
    init_logger();
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    fill(&mut teacher, 0..200);
    let config = test_config(&learner_dir).with_request_timeout(Duration::from_millis(300));
    let mut learner: VirtualMap = VirtualMap::open(config).unwrap();
    fill(&mut learner, 0..20);
    let before = leaves(&learner);
    let root = learner.root_hash().unwrap();

    let (teacher_end, learner_end, link) = memory_channel();
    link.stall_after(10);
    let mut serving = teacher.teacher().unwrap();
    let handle = thread::spawn(move || serving.serve(teacher_end));
    let outcome = learner.start_reconnect(Role::Learner, learner_end).unwrap();
    handle.join().unwrap().unwrap();

    assert_eq!(outcome, ReconnectOutcome::Timeout);
    assert_untouched(&learner, &learner_dir, &before, root);
}

/// 测试：学习方会话在其它线程上运行时，map 照常读写；超时后写入保留
#[test]
fn test_live_map_usable_during_stalled_session() {
    init_logger();
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    fill(&mut teacher, 0..200);
    let config = test_config(&learner_dir).with_request_timeout(Duration::from_millis(300));
    let mut learner: VirtualMap = VirtualMap::open(config).unwrap();
    fill(&mut learner, 0..20);

    let (teacher_end, learner_end, link) = memory_channel();
    link.stall_after(10);
    let mut serving = teacher.teacher().unwrap();
    let serve = thread::spawn(move || serving.serve(teacher_end));
    let mut session = learner.begin_reconnect().unwrap();
    assert_eq!(session.generation(), 1);
    let running = thread::spawn(move || {
        let outcome = session.run(learner_end);
        (session, outcome)
    });

    learner.put(&key(500), &value(500)).unwrap();
    assert_eq!(learner.get(&key(500)).unwrap(), Some(value(500)));
    assert_eq!(learner.get(&key(3)).unwrap(), Some(value(3)));
    assert_eq!(learner.remove(&key(0)).unwrap(), Some(value(0)));
    assert_eq!(learner.len(), 20);
    assert_eq!(learner.root_hash().unwrap(), reference_root(&leaves(&learner)));
    // 同一时刻只允许一个会话
    assert!(matches!(learner.begin_reconnect(), Err(MapError::Reconnect(_))));

    let (session, outcome) = running.join().unwrap();
    assert_eq!(outcome.unwrap(), ReconnectOutcome::Timeout);
    serve.join().unwrap().unwrap();
    let stats = session.stats();
    assert!(stats.requests_answered < stats.requests_sent);
    assert_eq!(learner.commit_reconnect(session).unwrap(), ReconnectOutcome::Timeout);

    assert_eq!(learner.generation(), 0);
    assert_eq!(learner.get(&key(500)).unwrap(), Some(value(500)));
    assert!(!learner.contains_key(&key(0)));
    let data_dir = test_config(&learner_dir).data_dir;
    assert!(!generation_dir(&data_dir, 1).exists());
    // 提交之后可以开始新的会话
    drop(learner.begin_reconnect().unwrap());
    assert!(!generation_dir(&data_dir, 1).exists());
}

/// 测试：会话成功提交后，会话期间的写入被教学方的状态取代
#[test]
fn test_commit_replaces_writes_made_during_session() {
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    let mut learner = open_map(&learner_dir);
    fill(&mut teacher, 0..100);
    fill(&mut learner, 50..150);

    let (teacher_end, learner_end, _link) = memory_channel();
    let mut serving = teacher.teacher().unwrap();
    let serve = thread::spawn(move || serving.serve(teacher_end));
    let mut session = learner.begin_reconnect().unwrap();
    let running = thread::spawn(move || {
        let outcome = session.run(learner_end);
        (session, outcome)
    });
    learner.put(&key(999), &value(999)).unwrap();

    let (session, outcome) = running.join().unwrap();
    assert!(outcome.unwrap().is_success());
    serve.join().unwrap().unwrap();
    assert!(learner.commit_reconnect(session).unwrap().is_success());

    assert_converged(&teacher, &learner);
    assert!(!learner.contains_key(&key(999)));
    assert_eq!(learner.generation(), 1);
}

/// 测试：未运行的会话不能提交，其暂存目录被删除
#[test]
fn test_unfinished_session_not_committed() {
    let dir = tempdir().unwrap();
    let mut map = open_map(&dir);
    fill(&mut map, 0..10);

    let session = map.begin_reconnect().unwrap();
    let data_dir = test_config(&dir).data_dir;
    assert!(generation_dir(&data_dir, 1).exists());
    assert!(matches!(
        map.commit_reconnect(session),
        Err(MapError::Reconnect(_))
    ));
    assert!(!generation_dir(&data_dir, 1).exists());
    assert_eq!(map.generation(), 0);
    assert_eq!(map.len(), 10);
}

/// 测试：宿主取消，标志在会话结束后清除
#[test]
fn test_cancel_handle() {
    let (teacher_dir, learner_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let mut teacher = open_map(&teacher_dir);
    fill(&mut teacher, 0..50);
    let mut learner = open_map(&learner_dir);
    let cancel = learner.cancel_handle();

    cancel.interrupt();
    let outcome = reconnect(&mut teacher, &mut learner);
    assert_eq!(outcome, ReconnectOutcome::Cancelled);
    assert!(learner.is_empty());
    assert!(!cancel.is_interrupted());

    assert!(reconnect(&mut teacher, &mut learner).is_success());
    assert_eq!(learner.len(), 50);
}

/// 手写的教学方：`lie_about_root` 时宣称一个错误的 root hash，
/// `fail_nodes` 时对节点请求回复错误
fn fake_teacher(channel: Channel, lie_about_root: bool, fail_nodes: bool) {
    let (mut sink, mut source) = channel.split();
    let leaf_hash = digest_leaf::<Blake3Hasher>(b"k", b"v");
    let honest_root = virtual_map::hash::digest_internal::<Blake3Hasher>(&leaf_hash, &NULL_HASH);

    while let Ok(frame) = source.recv_frame(Duration::from_secs(5)) {
        let request = Request::decode(&frame).unwrap();
        let body = match request.body {
            RequestBody::Start => ResponseBody::Start {
                leaf_count: 1,
                root_hash: if lie_about_root { [9u8; 32] } else { honest_root },
            },
            RequestBody::Hash(path) => ResponseBody::Error(format!("unexpected hash request {}", path)),
            RequestBody::Node(_) if fail_nodes => ResponseBody::Error("disk on fire".to_string()),
            RequestBody::Node(0) => ResponseBody::Node {
                path: 0,
                node: VirtualNode::Internal {
                    left_hash: leaf_hash,
                    right_hash: NULL_HASH,
                },
            },
            RequestBody::Node(path) => ResponseBody::Node {
                path,
                node: VirtualNode::Leaf {
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                },
            },
            RequestBody::Finish => return,
        };
        let response = Response { id: request.id, body };
        if sink.send_frame(response.encode().unwrap()).is_err() {
            return;
        }
    }
}

fn learn_from_fake(lie_about_root: bool, fail_nodes: bool) -> (ReconnectOutcome, VirtualMap, TempDir) {
    let dir = tempdir().unwrap();
    let mut learner = open_map(&dir);
    let (teacher_end, learner_end, _link) = memory_channel();
    let handle = thread::spawn(move || fake_teacher(teacher_end, lie_about_root, fail_nodes));
    let outcome = learner.start_reconnect(Role::Learner, learner_end).unwrap();
    handle.join().unwrap();
    (outcome, learner, dir)
}

/// 测试：手写教学方的诚实应答可以被正确接收
#[test]
fn test_fake_teacher_honest() {
    let (outcome, learner, _dir) = learn_from_fake(false, false);
    assert!(outcome.is_success());
    assert_eq!(learner.get(b"k").unwrap(), Some(b"v".to_vec()));
}

/// 测试：最终 hash 与宣称的 root 不一致时得到 HashMismatch
#[test]
fn test_hash_mismatch_rejected() {
    let (outcome, learner, _dir) = learn_from_fake(true, false);
    match outcome {
        ReconnectOutcome::HashMismatch { expected, actual } => {
            assert_eq!(expected, [9u8; 32]);
            assert_ne!(actual, expected);
        }
        other => panic!("expected hash mismatch, got {:?}", other),
    }
    assert!(learner.is_empty());
    assert_eq!(learner.generation(), 0);
}

/// 测试：教学方回复错误时得到 Cancelled
#[test]
fn test_teacher_error_cancels() {
    let (outcome, learner, _dir) = learn_from_fake(false, true);
    assert_eq!(outcome, ReconnectOutcome::Cancelled);
    assert!(learner.is_empty());
}
