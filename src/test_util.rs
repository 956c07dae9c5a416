use async_trait::async_trait;
use std::{sync::Once, time::Duration};
use tracing_subscriber::{layer::SubscriberExt as _, registry::Registry};

use crate::{EncryptionContext, Error, GeneratedDataKey, Key, KeyService, MasterKeyId};

static INIT: Once = Once::new();

pub(crate) fn init() {
	INIT.call_once(|| {
		let layer = tracing_tree::HierarchicalLayer::default()
			.with_writer(tracing_subscriber::fmt::TestWriter::new())
			.with_indent_lines(true)
			.with_indent_amount(2)
			.with_targets(true);

		let sub = Registry::default().with(layer);
		tracing::subscriber::set_global_default(sub).unwrap();
	});
}

/// A key service that never answers in any reasonable amount of time.
pub(crate) struct SlowKeyService(pub(crate) Duration);

#[async_trait]
impl KeyService for SlowKeyService {
	async fn generate_data_key(
		&self,
		_master_key_id: &MasterKeyId,
		_context: &EncryptionContext,
	) -> Result<GeneratedDataKey, Error> {
		tokio::time::sleep(self.0).await;
		Err(Error::invalid_input("should have timed out"))
	}

	async fn unwrap_data_key(
		&self,
		_wrapped: &[u8],
		_context: &EncryptionContext,
	) -> Result<Key, Error> {
		tokio::time::sleep(self.0).await;
		Err(Error::invalid_input("should have timed out"))
	}
}
