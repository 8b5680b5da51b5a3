use tessera_core::config::{CustomStreamsConfig, StreamSeed};
use tessera_core::stream::StreamId;

use crate::{ACCOUNT_ROOT, AccountShapeError, CatalogError, Catalogue, CatalogueOptions};

fn seed(id: &str) -> StreamSeed {
    StreamSeed {
        id: id.to_owned(),
        name: None,
        event_type: "note/txt".to_owned(),
        is_indexed: None,
        is_unique: None,
        is_shown: None,
        is_editable: None,
        is_required_in_validation: None,
        regex_validation: None,
        default: None,
        children: Vec::new(),
    }
}

fn build_with(custom: CustomStreamsConfig) -> Result<Catalogue, CatalogError> {
    Catalogue::build(CatalogueOptions {
        custom,
        ..Default::default()
    })
}

#[test]
fn builtin_catalogue_is_valid() {
    let cat = build_with(CustomStreamsConfig::default()).unwrap();

    let username = cat.get(":_system:username").unwrap();
    assert!(username.is_unique);
    assert!(username.is_indexed);
    assert!(!username.is_editable);
    assert_eq!(username.parent_id.as_deref(), Some(ACCOUNT_ROOT));

    let language = cat.get(":_system:language").unwrap();
    assert!(language.is_indexed);
    assert!(language.is_editable);
    assert_eq!(language.default, Some(serde_json::json!("en")));

    // markers keep their dotted ids
    assert!(cat.get(".active").is_some());
    assert!(cat.get(".unique").is_some());
    assert!(cat.is_account_stream(".active"));

    // storageUsed has its two children wired
    let storage = cat.get(":_system:storageUsed").unwrap();
    assert_eq!(storage.children.len(), 2);
    assert_eq!(
        cat.parent_of(":_system:dbDocuments"),
        Some(":_system:storageUsed")
    );
}

#[test]
fn ids_are_prefixed_exactly_once() {
    let custom = CustomStreamsConfig {
        account: vec![seed("email"), seed(":system:phoneNumber")],
        other: vec![],
    };
    let cat = build_with(custom).unwrap();
    assert!(cat.get(":system:email").is_some());
    // pre-prefixed seed is not prefixed again
    assert!(cat.get(":system:phoneNumber").is_some());
    assert!(cat.get(":system::system:phoneNumber").is_none());
}

#[test]
fn unique_requires_indexed() {
    let mut email = seed("email");
    email.is_unique = Some(true);
    let err = build_with(CustomStreamsConfig {
        account: vec![email],
        other: vec![],
    })
    .unwrap_err();
    assert!(matches!(err, CatalogError::UniqueNotIndexed { .. }));
}

#[test]
fn other_streams_must_stay_plain() {
    for mutate in [
        (|s: &mut StreamSeed| s.is_unique = Some(true)) as fn(&mut StreamSeed),
        |s| s.is_indexed = Some(true),
        |s| s.is_editable = Some(false),
        |s| s.is_required_in_validation = Some(true),
        |s| s.is_shown = Some(false),
    ] {
        let mut bad = seed("scratch");
        mutate(&mut bad);
        let err = build_with(CustomStreamsConfig {
            account: vec![],
            other: vec![bad],
        })
        .unwrap_err();
        assert!(
            matches!(
                err,
                CatalogError::OtherStreamConstraint { .. } | CatalogError::UniqueNotIndexed { .. }
            ),
            "unexpected error: {err}"
        );
    }
}

#[test]
fn duplicate_ids_are_rejected() {
    let err = build_with(CustomStreamsConfig {
        account: vec![seed("email"), seed("email")],
        other: vec![],
    })
    .unwrap_err();
    assert!(matches!(err, CatalogError::DuplicateId { .. }));
}

#[test]
fn unprefixed_duplicates_depend_on_compat_flag() {
    // `:system:language` collides with built-in `:_system:language` only by
    // bare name.
    let custom = CustomStreamsConfig {
        account: vec![seed("language")],
        other: vec![],
    };

    assert!(
        Catalogue::build(CatalogueOptions {
            custom: custom.clone(),
            ..Default::default()
        })
        .is_ok()
    );

    let err = Catalogue::build(CatalogueOptions {
        custom,
        backward_compatibility_prefix: true,
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, CatalogError::DuplicateId { .. }));
}

#[test]
fn short_ids_and_bad_types_are_rejected() {
    let err = build_with(CustomStreamsConfig {
        account: vec![seed("x")],
        other: vec![],
    })
    .unwrap_err();
    assert!(matches!(err, CatalogError::IdTooShort { .. }));

    let mut bad = seed("email");
    bad.event_type = "Email".to_owned();
    let err = build_with(CustomStreamsConfig {
        account: vec![bad],
        other: vec![],
    })
    .unwrap_err();
    assert!(matches!(err, CatalogError::MalformedType { .. }));
}

#[test]
fn derived_sets() {
    let mut email = seed("email");
    email.is_unique = Some(true);
    email.is_indexed = Some(true);
    let cat = build_with(CustomStreamsConfig {
        account: vec![email, seed("phoneNumber")],
        other: vec![seed("scratch")],
    })
    .unwrap();

    assert!(cat.is_indexed("email"));
    assert!(cat.is_unique("email"));
    assert!(cat.is_indexed("username"));
    assert!(!cat.is_indexed("phoneNumber"));
    assert!(!cat.is_indexed("scratch"));

    let forbidden_read: Vec<&str> = cat.forbidden_for_reading().collect();
    assert!(forbidden_read.contains(&":_system:passwordHash"));
    assert!(!forbidden_read.contains(&":_system:language"));

    assert!(!cat.is_editable(":_system:username"));
    assert!(cat.is_editable(":system:email"));

    assert_eq!(
        cat.account_roots_requiring_read(),
        &[":_system:account".to_owned(), ":_system:helpers".to_owned()]
    );

    // `other` streams are not account streams
    assert!(!cat.is_account_stream(":system:scratch"));
    assert!(cat.is_account_stream(":system:email"));
}

#[test]
fn account_leaf_extraction() {
    let cat = build_with(CustomStreamsConfig {
        account: vec![seed("email")],
        other: vec![],
    })
    .unwrap();

    let ids = vec![
        StreamId::from(":system:email"),
        StreamId::from(".active"),
        StreamId::from("diary"),
    ];
    let leaves = cat.account_leaves_in(&ids);
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].id, ":system:email");
}

#[test]
fn account_stream_classification() {
    let cat = build_with(CustomStreamsConfig {
        account: vec![seed("email"), seed("phoneNumber")],
        other: vec![],
    })
    .unwrap();

    let ids = |raw: &[&str]| raw.iter().map(|s| StreamId::from(*s)).collect::<Vec<_>>();

    // plain events pass through untouched
    assert!(
        cat.classify_account_streams(&ids(&["diary", "work"]))
            .unwrap()
            .is_none()
    );

    // one leaf plus markers is the canonical account shape
    let leaf = cat
        .classify_account_streams(&ids(&[":system:email", ".active", ".unique"]))
        .unwrap()
        .expect("account leaf");
    assert_eq!(leaf.id, ":system:email");

    // a leaf may not ride along with an unrelated stream
    assert_eq!(
        cat.classify_account_streams(&ids(&[":system:email", "diary"]))
            .unwrap_err(),
        AccountShapeError::MixedWithOtherStreams {
            id: "diary".to_owned()
        }
    );

    // never two account leaves in one event
    assert_eq!(
        cat.classify_account_streams(&ids(&[":system:email", ":system:phoneNumber"]))
            .unwrap_err(),
        AccountShapeError::MultipleAccountLeaves
    );

    // a stray marker without its leaf is malformed
    assert_eq!(
        cat.classify_account_streams(&ids(&[".active", "diary"]))
            .unwrap_err(),
        AccountShapeError::NotAnAccountLeaf {
            id: ".active".to_owned()
        }
    );

    // so is attaching events to an account branch that is not a leaf
    assert_eq!(
        cat.classify_account_streams(&ids(&[":_system:storageUsed"]))
            .unwrap_err(),
        AccountShapeError::NotAnAccountLeaf {
            id: ":_system:storageUsed".to_owned()
        }
    );
}

#[test]
fn legacy_dotted_reads_are_translated() {
    let cat = Catalogue::build(CatalogueOptions {
        legacy_dotted_reads: true,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(cat.get_for_read(".language").unwrap().id, ":_system:language");
    assert!(cat.get_for_read(".nosuch").is_none());

    let cat = Catalogue::build(CatalogueOptions::default()).unwrap();
    assert!(cat.get_for_read(".language").is_none());
}
