use async_trait::async_trait;
use phi_vault::{
	DECRYPTION_FAILED, EncryptedField, EncryptionContext, EngineConfig, Error, FieldInput,
	GeneratedDataKey, Key, KeyService, KeyUnavailableReason, LocalKeyService, MasterKeyId,
	PhiEngine, generate_key,
};
use proptest::prelude::*;
use serde_json::json;
use std::{
	collections::BTreeMap,
	sync::{
		Arc, Once,
		atomic::{AtomicUsize, Ordering},
	},
};

static INIT: Once = Once::new();

fn init() {
	INIT.call_once(|| {
		tracing_subscriber::fmt()
			.with_test_writer()
			.with_max_level(tracing::Level::DEBUG)
			.init();
	});
}

fn engine() -> (PhiEngine, Arc<LocalKeyService>) {
	init();
	let kms = Arc::new(LocalKeyService::new());
	kms.add_master_key("alias/phi".into(), generate_key())
		.unwrap();

	(
		PhiEngine::new(kms.clone(), EngineConfig::new("alias/phi")).unwrap(),
		kms,
	)
}

/// Passes everything through to a real key service, except unwrapping of one field, which
/// fails as though the network had gone away.
struct FlakyKeyService {
	inner: LocalKeyService,
	broken_field: &'static str,
	unwraps: AtomicUsize,
}

#[async_trait]
impl KeyService for FlakyKeyService {
	async fn generate_data_key(
		&self,
		master_key_id: &MasterKeyId,
		context: &EncryptionContext,
	) -> Result<GeneratedDataKey, Error> {
		self.inner.generate_data_key(master_key_id, context).await
	}

	async fn unwrap_data_key(
		&self,
		wrapped: &[u8],
		context: &EncryptionContext,
	) -> Result<Key, Error> {
		self.unwraps.fetch_add(1, Ordering::SeqCst);

		if context.get("field") == Some(self.broken_field) {
			return Err(Error::key_unavailable(
				"alias/phi",
				KeyUnavailableReason::Transport("connection reset".into()),
			));
		}

		self.inner.unwrap_data_key(wrapped, context).await
	}
}

fn field_ctx(field: &str) -> EncryptionContext {
	EncryptionContext::for_clinic("c1").with("field", field)
}

#[tokio::test]
async fn clinic_scenario() {
	let (engine, _) = engine();

	let phone = engine
		.encrypt_phi("555-0100", &EncryptionContext::for_clinic("c1"))
		.await
		.unwrap();

	let mut elsewhere = phone.clone();
	elsewhere.context = EncryptionContext::for_clinic("c2");
	assert!(matches!(
		engine.decrypt_phi(&elsewhere).await,
		Err(Error::Decryption)
	));

	assert_eq!("555-0100", engine.decrypt_phi(&phone).await.unwrap());
}

#[tokio::test]
async fn survives_the_document_store() {
	let (engine, _) = engine();

	let field = engine
		.encrypt_phi("Jane Q. Patient", &field_ctx("name"))
		.await
		.unwrap();

	let stored = serde_json::to_string(&field).unwrap();
	assert!(!stored.contains("Jane"));

	let loaded: EncryptedField = serde_json::from_str(&stored).unwrap();
	assert_eq!("Jane Q. Patient", engine.decrypt_phi(&loaded).await.unwrap());
}

#[tokio::test]
async fn batch_asymmetry() {
	init();
	let flaky = Arc::new(FlakyKeyService {
		inner: LocalKeyService::new(),
		broken_field: "phone",
		unwraps: AtomicUsize::new(0),
	});
	flaky
		.inner
		.add_master_key("alias/phi".into(), generate_key())
		.unwrap();
	let engine = PhiEngine::new(flaky.clone(), EngineConfig::new("alias/phi")).unwrap();

	let fields = vec![
		FieldInput::new("name", "John Smith", field_ctx("name")),
		FieldInput::new("phone", "555-123-4567", field_ctx("phone")),
		FieldInput::new("dob", "1970-01-01", field_ctx("dob")),
	];

	// Reading: the broken field degrades, everything else comes through
	let encrypted = engine.encrypt_batch(fields.clone()).await.unwrap();
	let report = engine.decrypt_batch_report(&encrypted).await;

	assert_eq!(3, report.values.len());
	assert_eq!("John Smith", report.values["name"]);
	assert_eq!(DECRYPTION_FAILED, report.values["phone"]);
	assert_eq!("1970-01-01", report.values["dob"]);
	assert_eq!(vec!["phone".to_string()], report.failed);
	assert_eq!(3, flaky.unwraps.load(Ordering::SeqCst));

	// Writing: the same sort of trouble sinks the whole batch
	let mut fields = fields;
	fields[1].value = String::new();

	match engine.encrypt_batch(fields).await {
		Err(Error::Encryption { fields }) => assert_eq!(vec!["phone".to_string()], fields),
		other => panic!("expected the batch to fail, got {other:?}"),
	}
}

#[tokio::test]
async fn transient_unwrap_failures_stay_retryable() {
	init();
	let flaky = Arc::new(FlakyKeyService {
		inner: LocalKeyService::new(),
		broken_field: "phone",
		unwraps: AtomicUsize::new(0),
	});
	flaky
		.inner
		.add_master_key("alias/phi".into(), generate_key())
		.unwrap();
	let engine = PhiEngine::new(flaky, EngineConfig::new("alias/phi")).unwrap();

	let field = engine
		.encrypt_phi("555-123-4567", &field_ctx("phone"))
		.await
		.unwrap();

	let err = engine.decrypt_phi(&field).await.unwrap_err();
	assert!(err.is_retryable());
	assert_eq!("key_unavailable", err.class());
}

#[tokio::test]
async fn search_without_plaintext() {
	let (engine, _) = engine();
	let ctx = EncryptionContext::for_clinic("c1");

	let index = engine
		.generate_search_tokens("John Smith 555-123-4567", "s3cret-salt", &ctx)
		.await
		.unwrap();

	let stored = serde_json::to_string(&index).unwrap();
	for leak in ["john", "smith", "5551234567"] {
		assert!(!stored.to_lowercase().contains(leak));
	}

	for query in ["smi", "John", "555-123-4567", "555"] {
		assert!(
			engine.search_matches(&index, "s3cret-salt", query).await.unwrap(),
			"{query} should match"
		);
	}
	assert!(
		!engine
			.search_matches(&index, "s3cret-salt", "jones")
			.await
			.unwrap()
	);

	// An index is no use outside its own clinic either
	let mut moved = index.clone();
	moved.context = EncryptionContext::for_clinic("c2").with("purpose", "SEARCH_TOKENS");
	assert!(engine.search_matches(&moved, "s3cret-salt", "smi").await.is_err());
}

#[tokio::test]
async fn values_and_indexes_do_not_mix() {
	let (engine, _) = engine();
	let ctx = EncryptionContext::for_clinic("c1");

	let name = engine.encrypt_phi("John Smith", &ctx).await.unwrap();
	assert_eq!(Some("PHI"), name.context.purpose());
	assert_eq!(Some("c1"), name.context.get("clinicId"));

	let index = engine
		.generate_search_tokens("John Smith", "pepper", &ctx)
		.await
		.unwrap();
	assert_eq!(Some("SEARCH_TOKENS"), index.context.purpose());

	assert!(matches!(
		engine.decrypt_phi(&index).await,
		Err(Error::InvalidInput(_))
	));
	assert!(matches!(
		engine.reencrypt_phi(&index).await,
		Err(Error::InvalidInput(_))
	));
	assert!(matches!(
		engine.search_matches(&name, "pepper", "john").await,
		Err(Error::InvalidInput(_))
	));
}

#[tokio::test]
async fn typing_more_of_a_name_still_matches() {
	let (engine, _) = engine();

	let index = engine
		.generate_search_tokens(
			"Christopher Smith",
			"pepper",
			&EncryptionContext::for_clinic("c1"),
		)
		.await
		.unwrap();

	for query in ["chris", "christop", "christoph", "christophe", "christopher"] {
		assert!(
			engine.search_matches(&index, "pepper", query).await.unwrap(),
			"{query} should match"
		);
	}
	assert!(!engine.search_matches(&index, "pepper", "christina").await.unwrap());
}

#[tokio::test]
async fn mangled_ciphertext_is_an_integrity_failure() {
	let (engine, _) = engine();

	let mut field = engine
		.encrypt_phi("555-0100", &EncryptionContext::for_clinic("c1"))
		.await
		.unwrap();
	field.ciphertext.truncate(10);

	assert!(matches!(
		engine.decrypt_phi(&field).await,
		Err(Error::Integrity)
	));
}

#[tokio::test]
async fn rotation_and_reencryption() {
	let (engine, kms) = engine();
	let ctx = field_ctx("ssn");

	let old = engine.encrypt_phi("078-05-1120", &ctx).await.unwrap();
	kms.rotate_master_key(&"alias/phi".into()).unwrap();

	// Old ciphertexts still readable after rotation
	assert_eq!("078-05-1120", engine.decrypt_phi(&old).await.unwrap());

	let new = engine.reencrypt_phi(&old).await.unwrap();
	assert_ne!(old.ciphertext, new.ciphertext);
	assert_eq!(old.context, new.context);
	assert_eq!("078-05-1120", engine.decrypt_phi(&new).await.unwrap());
}

#[tokio::test]
async fn audit_trail() {
	let (engine, _) = engine();

	let mut fields = BTreeMap::new();
	fields.insert(
		"phone".to_string(),
		engine
			.encrypt_phi("555-0100", &field_ctx("phone"))
			.await
			.unwrap(),
	);
	let record = json!({
		"patientId": "p-1",
		"clinicId": "c1",
		"fields": fields,
	});

	let hash = engine.create_audit_hash(&record).unwrap();
	assert!(engine.verify_audit_hash(&record, &hash).unwrap());
	assert!(engine.ensure_audit_hash(&record, &hash).is_ok());

	let mut tampered = record.clone();
	tampered["clinicId"] = json!("c2");
	assert!(!engine.verify_audit_hash(&tampered, &hash).unwrap());
	assert!(matches!(
		engine.ensure_audit_hash(&tampered, &hash),
		Err(Error::AuditMismatch)
	));
}

#[tokio::test]
async fn index_hashes_for_deduplication() {
	let (engine, _) = engine();

	let a = engine.hash_for_index("555-0100", "tenant-salt").unwrap();
	assert_eq!(a, engine.hash_for_index("555-0100", "tenant-salt").unwrap());
	assert_ne!(a, engine.hash_for_index("555-0100", "other-salt").unwrap());
	assert_eq!(64, a.len());
}

#[test]
fn bad_config_is_refused() {
	let kms = Arc::new(LocalKeyService::new());

	assert!(matches!(
		PhiEngine::new(kms, EngineConfig::new("")),
		Err(Error::Config(_))
	));
}

proptest! {
	#![proptest_config(ProptestConfig::with_cases(32))]

	#[test]
	fn round_trip(plaintext in "\\PC*[^\\s]\\PC*", clinic in "[a-z0-9]{1,8}") {
		let rt = tokio::runtime::Builder::new_current_thread()
			.enable_time()
			.build()
			.unwrap();
		let (engine, _) = engine();
		let ctx = EncryptionContext::for_clinic(clinic);

		let decrypted = rt.block_on(async {
			let field = engine.encrypt_phi(&plaintext, &ctx).await?;
			engine.decrypt_phi(&field).await
		});

		prop_assert_eq!(plaintext, decrypted.unwrap());
	}
}
