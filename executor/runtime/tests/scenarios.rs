//! End-to-end turn scenarios: one or two vats, real storage, the transport
//! replaced by explicit queue shuttling.

use serde_json::json;
use tempfile::tempdir;
use vatrun_id_types::{MemoryId, RefId, UrbjectId, VatId};
use vatrun_kv_store::backend::lmdb::Lmdb;
use vatrun_runtime::{Envelope, Vat, MAX_SUB_DBS};

fn new_vat() -> (Vat<Lmdb>, tempfile::TempDir) {
    let tmp = tempdir().unwrap();
    let db = Lmdb::new(tmp.path(), MAX_SUB_DBS).unwrap();
    (Vat::create(db).unwrap(), tmp)
}

fn invoke_payload(urbjid: &UrbjectId, args: serde_json::Value) -> Vec<u8> {
    Envelope::Invoke {
        urbjid: urbjid.clone(),
        args_json: args.to_string(),
    }
    .to_bytes()
    .unwrap()
}

fn memory_contents(vat: &Vat<Lmdb>, memid: &MemoryId) -> serde_json::Value {
    serde_json::from_str(&vat.dump_memory(memid).unwrap()).unwrap()
}

/// Moves every pending message from `from`'s outbound queue for `to` into
/// `to`'s inbound queue and drains it. What the transport would do, minus
/// the cryptography.
fn pump(from: &Vat<Lmdb>, to: &Vat<Lmdb>) -> u32 {
    let mut delivered = 0;
    for payload in from.take_outbound(to.id()).unwrap() {
        to.enqueue_inbound(from.id(), &payload).unwrap();
        delivered += to.drain_inbound().unwrap();
    }
    delivered
}

#[test]
fn s1_simple_invoke() {
    let (vat, _tmp) = new_vat();
    let memid = vat.create_memory("{}").unwrap();
    let code = r#"
        fn call(args, power) {
            power["memory"]["argfoo"] = args["foo"];
        }
    "#;
    let target = vat.create_urbject(code, Some(&memid)).unwrap();

    let payload = invoke_payload(&target.urbject, json!({"foo": 123}));
    vat.enqueue_inbound(vat.id(), &payload).unwrap();
    assert_eq!(vat.drain_inbound().unwrap(), 1);

    assert_eq!(memory_contents(&vat, &memid), json!({"argfoo": 123}));
}

#[test]
fn s2_reference_passes_through() {
    let (vat, _tmp) = new_vat();
    let memid = vat.create_memory("{}").unwrap();
    let code = r#"
        fn call(args, power) {
            power["memory"]["argfoo"] = args["foo"];
        }
    "#;
    let target = vat.create_urbject(code, Some(&memid)).unwrap();

    let foreign = RefId::new(VatId::generate(), UrbjectId::generate());
    let refjson = serde_json::to_value(&foreign).unwrap();
    let args = json!({"foo": {"__power__": "reference", "swissnum": refjson}});
    vat.enqueue_inbound(vat.id(), &invoke_payload(&target.urbject, args))
        .unwrap();
    assert_eq!(vat.drain_inbound().unwrap(), 1);

    let refjson = serde_json::to_value(&foreign).unwrap();
    assert_eq!(
        memory_contents(&vat, &memid),
        json!({"argfoo": {"__power__": "reference", "swissnum": refjson}})
    );
}

#[test]
fn s3_loopback_send() {
    let (vat, _tmp) = new_vat();
    let memid = vat.create_memory("{}").unwrap();
    let sink_code = r#"
        fn call(args, power) {
            power["memory"]["argfoo"] = args["foo"];
        }
    "#;
    let sink = vat.create_urbject(sink_code, Some(&memid)).unwrap();

    let sender_code = r#"
        fn call(args, power) {
            args["ref"].send({"foo": 34});
        }
    "#;
    let sender = vat.create_urbject(sender_code, None).unwrap();

    let refjson = serde_json::to_value(&sink).unwrap();
    let args = json!({"ref": {"__power__": "reference", "swissnum": refjson}});
    vat.enqueue_inbound(vat.id(), &invoke_payload(&sender.urbject, args))
        .unwrap();
    assert_eq!(vat.drain_inbound().unwrap(), 1);

    // the send went through the outbound queue, addressed to ourselves
    let delivered = pump(&vat, &vat);
    assert_eq!(delivered, 1);
    assert_eq!(memory_contents(&vat, &memid), json!({"argfoo": 34}));
}

#[test]
fn s4_make_urbject_then_send() {
    let (vat, _tmp) = new_vat();
    let memid = vat.create_memory("{}").unwrap();
    // handing the child our own power shares both the powid and the memory
    let code = r#"
        fn call(args, power) {
            let child = power["make_urbject"]("fn call(args, power) { power[\"memory\"][\"x\"] = args[\"foo\"]; }", power);
            child.send({"foo": 42});
        }
    "#;
    let maker = vat.create_urbject(code, Some(&memid)).unwrap();

    vat.enqueue_inbound(vat.id(), &invoke_payload(&maker.urbject, json!({})))
        .unwrap();
    assert_eq!(vat.drain_inbound().unwrap(), 1);

    // the child exists alongside the maker
    assert_eq!(vat.list_urbjects().unwrap().len(), 2);

    assert_eq!(pump(&vat, &vat), 1);
    assert_eq!(memory_contents(&vat, &memid), json!({"x": 42}));
}

#[test]
fn s5_callback_across_vats() {
    let (vat_a, _tmp_a) = new_vat();
    let (vat_b, _tmp_b) = new_vat();

    let memid = vat_a.create_memory("{}").unwrap();
    let f4_code = r#"
        fn call(args, power) {
            let cb = power["make_urbject"]("fn call(args, power) { power[\"memory\"][\"results\"] = args[\"response\"]; }", power);
            args["peer"].send({"callback": cb});
        }
    "#;
    let f4 = vat_a.create_urbject(f4_code, Some(&memid)).unwrap();

    let f4b_code = r#"
        fn call(args, power) {
            args["callback"].send({"response": 34});
        }
    "#;
    let f4b = vat_b.create_urbject(f4b_code, None).unwrap();

    // turn 1: F4 on A mints the callback and messages F4b on B
    let refjson = serde_json::to_value(&f4b).unwrap();
    let args = json!({"peer": {"__power__": "reference", "swissnum": refjson}});
    vat_a
        .enqueue_inbound(vat_a.id(), &invoke_payload(&f4.urbject, args))
        .unwrap();
    assert_eq!(vat_a.drain_inbound().unwrap(), 1);

    // turn 2: F4b on B answers the callback
    assert_eq!(pump(&vat_a, &vat_b), 1);
    // turn 3: the callback on A records the response
    assert_eq!(pump(&vat_b, &vat_a), 1);

    assert_eq!(memory_contents(&vat_a, &memid), json!({"results": 34}));
}

#[test]
fn s6_forged_tag_aborts_the_turn() {
    let (vat, _tmp) = new_vat();
    let memid = vat.create_memory("{}").unwrap();
    let code = r#"
        fn call(args, power) {
            power["memory"]["ok"] = 1;
            power["memory"]["bad"] = {"__power__": "reference", "swissnum": ["v", "u"]};
        }
    "#;
    let target = vat.create_urbject(code, Some(&memid)).unwrap();

    vat.enqueue_inbound(vat.id(), &invoke_payload(&target.urbject, json!({})))
        .unwrap();
    let err = vat.drain_inbound().unwrap_err();
    assert!(err.is_confinement_fault(), "got: {err}");

    // nothing committed, and the message is still queued for redelivery
    assert_eq!(memory_contents(&vat, &memid), json!({}));
    assert!(vat.drain_inbound().is_err());
}

#[test]
fn execute_command_runs_against_adhoc_power() {
    let (vat, _tmp) = new_vat();
    let memid = vat.create_memory(r#"{"counter": 10}"#).unwrap();
    let code = r#"
        fn call(args, power) {
            power["memory"]["counter"] = power["memory"]["counter"] + args["delta"];
        }
    "#;
    vat.send_execute(&memid, code, r#"{"delta": 5}"#).unwrap();
    assert_eq!(vat.drain_inbound().unwrap(), 1);
    assert_eq!(memory_contents(&vat, &memid), json!({"counter": 15}));
}

#[test]
fn unknown_and_malformed_commands_are_dropped() {
    let (vat, _tmp) = new_vat();
    let from = vat.id().clone();
    vat.enqueue_inbound(&from, br#"{"command": "hello"}"#).unwrap();
    vat.enqueue_inbound(&from, b"not json at all").unwrap();
    vat.enqueue_inbound(&from, br#"{"command": "invoke"}"#).unwrap();
    // all three are consumed without failing the drain
    assert_eq!(vat.drain_inbound().unwrap(), 3);
}

#[test]
fn missing_urbject_fails_the_turn() {
    let (vat, _tmp) = new_vat();
    let ghost = UrbjectId::generate();
    vat.enqueue_inbound(vat.id(), &invoke_payload(&ghost, json!({})))
        .unwrap();
    let err = vat.drain_inbound().unwrap_err();
    assert!(err.is_missing_entity(), "got: {err}");
}

#[test]
fn guest_exception_rolls_back_everything() {
    let (vat, _tmp) = new_vat();
    let memid = vat.create_memory(r#"{"n": 1}"#).unwrap();
    let peer = VatId::generate();
    let remote = RefId::new(peer.clone(), UrbjectId::generate());
    let refjson = serde_json::to_value(&remote).unwrap();
    let code = r#"
        fn call(args, power) {
            power["memory"]["n"] = 2;
            power["make_urbject"]("fn call(a, p) { return null; }", {"k": 1});
            args["r"].send({"hello": true});
            let boom = 1 / 0;
        }
    "#;
    let target = vat.create_urbject(code, Some(&memid)).unwrap();
    let urbjects_before = vat.list_urbjects().unwrap().len();

    let args = json!({"r": {"__power__": "reference", "swissnum": refjson}});
    vat.enqueue_inbound(vat.id(), &invoke_payload(&target.urbject, args))
        .unwrap();
    assert!(vat.drain_inbound().is_err());

    // memory unchanged, no new urbject, nothing for the transport
    assert_eq!(memory_contents(&vat, &memid), json!({"n": 1}));
    assert_eq!(vat.list_urbjects().unwrap().len(), urbjects_before);
    assert!(vat.take_outbound(&peer).unwrap().is_empty());
}

#[test]
fn sends_arrive_in_program_order_with_monotonic_seqs() {
    let (vat, _tmp) = new_vat();
    let peer = VatId::generate();
    let remote = RefId::new(peer.clone(), UrbjectId::generate());
    let refjson = serde_json::to_value(&remote).unwrap();
    let code = r#"
        fn call(args, power) {
            args["r"].send({"n": 1});
            args["r"].send({"n": 2});
            args["r"].send({"n": 3});
        }
    "#;
    let target = vat.create_urbject(code, None).unwrap();
    let args = json!({"r": {"__power__": "reference", "swissnum": refjson}});

    for _ in 0..2 {
        vat.enqueue_inbound(vat.id(), &invoke_payload(&target.urbject, args.clone()))
            .unwrap();
        assert_eq!(vat.drain_inbound().unwrap(), 1);
    }

    let payloads = vat.take_outbound(&peer).unwrap();
    assert_eq!(payloads.len(), 6);
    let ns: Vec<i64> = payloads
        .iter()
        .map(|p| {
            let envelope: serde_json::Value = serde_json::from_slice(p).unwrap();
            let args: serde_json::Value =
                serde_json::from_str(envelope["args_json"].as_str().unwrap()).unwrap();
            args["n"].as_i64().unwrap()
        })
        .collect();
    // program order within each turn, turn order across turns
    assert_eq!(ns, vec![1, 2, 3, 1, 2, 3]);
}

#[test]
fn sync_call_shares_memory_and_returns_host_values() {
    let (vat, _tmp) = new_vat();
    let memid = vat.create_memory("{}").unwrap();

    let callee_code = r#"
        fn call(args, power) {
            power["memory"]["from_g"] = 7;
            return 99;
        }
    "#;
    let callee = vat.create_urbject(callee_code, Some(&memid)).unwrap();

    // the caller observes the callee's write immediately upon return
    let caller_code = r#"
        fn call(args, power) {
            let rc = args["g"].call({});
            power["memory"]["rc"] = rc;
            power["memory"]["saw"] = power["memory"]["from_g"];
        }
    "#;
    let caller = vat.create_urbject(caller_code, Some(&memid)).unwrap();

    let refjson = serde_json::to_value(&callee).unwrap();
    let args = json!({"g": {"__power__": "reference", "swissnum": refjson}});
    vat.enqueue_inbound(vat.id(), &invoke_payload(&caller.urbject, args))
        .unwrap();
    assert_eq!(vat.drain_inbound().unwrap(), 1);

    assert_eq!(
        memory_contents(&vat, &memid),
        json!({"from_g": 7, "rc": 99, "saw": 7})
    );
}

#[test]
fn sync_call_to_remote_vat_fails() {
    let (vat, _tmp) = new_vat();
    let remote = RefId::new(VatId::generate(), UrbjectId::generate());
    let refjson = serde_json::to_value(&remote).unwrap();
    let code = r#"
        fn call(args, power) {
            args["r"].call({});
        }
    "#;
    let target = vat.create_urbject(code, None).unwrap();
    let args = json!({"r": {"__power__": "reference", "swissnum": refjson}});
    vat.enqueue_inbound(vat.id(), &invoke_payload(&target.urbject, args))
        .unwrap();
    assert!(vat.drain_inbound().is_err());
}

#[test]
fn same_raw_mapping_does_not_share_memory() {
    let (vat, _tmp) = new_vat();
    let memid = vat.create_memory("{}").unwrap();
    // two children built from the same literal mapping get distinct memories
    let code = r#"
        fn call(args, power) {
            let init = {"seed": 1};
            let a = power["make_urbject"]("fn call(a, p) { return null; }", {"memory": init});
            let b = power["make_urbject"]("fn call(a, p) { return null; }", {"memory": init});
            power["memory"]["done"] = true;
        }
    "#;
    let target = vat.create_urbject(code, Some(&memid)).unwrap();
    let memories_before = vat.list_memories().unwrap().len();

    vat.enqueue_inbound(vat.id(), &invoke_payload(&target.urbject, json!({})))
        .unwrap();
    assert_eq!(vat.drain_inbound().unwrap(), 1);

    // two fresh memories were minted, both initialized from the literal
    let memories = vat.list_memories().unwrap();
    assert_eq!(memories.len(), memories_before + 2);
    for memid in memories {
        let contents = memory_contents(&vat, &memid);
        assert!(contents == json!({"seed": 1}) || contents == json!({"done": true}));
    }
}
