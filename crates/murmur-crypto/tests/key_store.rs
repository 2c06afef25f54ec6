use murmur_crypto::MurmurEngine;
use murmur_session::{ClientConfig, FragPolicy, Policy, UserState, UserStateOptions};
use tempfile::NamedTempFile;

fn state() -> UserState<MurmurEngine> {
    UserState::new(MurmurEngine::new(), UserStateOptions::default())
}

#[test]
fn generate_and_find() {
    let keyfile = NamedTempFile::new().unwrap();
    let state = state();
    state
        .generate_privkey_to("test@test", "icq", keyfile.path())
        .unwrap();
    assert!(state.find_privkey("test@test", "icq").unwrap().is_some());
    assert!(state.find_privkey("notfound@test", "icq").unwrap().is_none());
}

#[test]
fn reading_the_key_store_gives_the_same_key() {
    let keyfile = NamedTempFile::new().unwrap();
    let state = state();
    state
        .generate_privkey_to("test@test", "icq", keyfile.path())
        .unwrap();

    let state2 = UserState::new(
        MurmurEngine::new(),
        UserStateOptions::new().key_store(keyfile.path()),
    );
    let key1 = state.find_privkey("test@test", "icq").unwrap().unwrap();
    let key2 = state2.find_privkey("test@test", "icq").unwrap().unwrap();
    assert_eq!(key1.fingerprint(), key2.fingerprint());
    assert_eq!(key2.accountname(), "test@test");
    assert_eq!(key2.protocol(), "icq");
}

#[test]
fn forget_one_key() {
    let keyfile = NamedTempFile::new().unwrap();
    let state = state();
    state
        .generate_privkey_to("test@test", "icq", keyfile.path())
        .unwrap();
    let key = state.find_privkey("test@test", "icq").unwrap().unwrap();
    assert!(key.forget().unwrap());
    assert!(state.find_privkey("test@test", "icq").unwrap().is_none());
}

#[test]
fn forget_all_keys() {
    let keyfile = NamedTempFile::new().unwrap();
    let state = state();
    state
        .generate_privkey_to("test1@test", "icq", keyfile.path())
        .unwrap();
    state
        .generate_privkey_to("test2@test", "icq", keyfile.path())
        .unwrap();
    state.forget_all().unwrap();
    assert!(state.find_privkey("test1@test", "icq").unwrap().is_none());
    assert!(state.find_privkey("test2@test", "icq").unwrap().is_none());

    // the file still holds both
    let reloaded = UserState::new(
        MurmurEngine::new(),
        UserStateOptions::new().key_store(keyfile.path()),
    );
    assert!(reloaded.find_privkey("test1@test", "icq").unwrap().is_some());
    assert!(reloaded.find_privkey("test2@test", "icq").unwrap().is_some());
}

#[test]
fn keys_for_other_protocols_are_separate() {
    let state = state();
    state.generate_privkey("test@test", "icq").unwrap();
    state.generate_privkey("test@test", "xmpp").unwrap();
    let icq = state.find_privkey("test@test", "icq").unwrap().unwrap();
    let xmpp = state.find_privkey("test@test", "xmpp").unwrap().unwrap();
    assert_ne!(icq.fingerprint(), xmpp.fingerprint());
}

#[test]
fn create_client() {
    let mut state = state();
    let client = state
        .create_client(
            ClientConfig::new()
                .protocol("icq")
                .max_message_size(10)
                .frag_policy(FragPolicy::SendAll),
        )
        .unwrap();
    assert_eq!(client.protocol(), "icq");
    assert_eq!(client.max_message_size(), Some(10));
    assert_eq!(client.frag_policy(), FragPolicy::SendAll);
}

#[test]
fn create_client_from_toml() {
    let mut state = state();
    let config = ClientConfig::from_toml_str(
        r#"
        protocol = "icq"
        max_message_size = 10
        frag_policy = "send_all"
        "#,
    )
    .unwrap();
    let client = state.create_client(config).unwrap();
    assert_eq!(client.frag_policy(), FragPolicy::SendAll);
    assert_eq!(state.each_client().count(), 1);
}

#[test]
fn empty_instag_file_receives_the_new_tag() {
    let instags = NamedTempFile::new().unwrap();
    let mut state = UserState::new(
        MurmurEngine::new(),
        UserStateOptions::new().instag_store(instags.path()),
    );
    state.generate_privkey("alice", "icq").unwrap();
    let client = state
        .create_client(ClientConfig::new().protocol("icq"))
        .unwrap();
    client
        .add_account("alice")
        .add_contact("bob", Policy::Opportunistic)
        .log_in();
    state
        .client(0)
        .unwrap()
        .account("alice")
        .unwrap()
        .contact("bob")
        .unwrap()
        .send("hi", Default::default())
        .unwrap();

    let text = std::fs::read_to_string(instags.path()).unwrap();
    let line = text.lines().next().unwrap();
    let fields: Vec<&str> = line.split('\t').collect();
    assert_eq!(&fields[..2], ["alice", "icq"]);
    assert!(u32::from_str_radix(fields[2], 16).unwrap() >= 0x100);
}

