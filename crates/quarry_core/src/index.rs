//! Secondary index and foreign-key materialization.

use crate::catalog::{EntityDescriptor, PayloadReader};
use crate::error::CoreResult;
use crate::schema::HandleCache;
use quarry_engine::{ForeignDeleteAction, KeyExtractor};
use std::sync::Arc;
use tracing::debug;

/// Opens and associates every secondary declared by `descriptor` and attaches
/// its foreign-key constraints. Returns the number of indices built.
///
/// All field accessors are resolved before any database is touched, so an
/// unresolvable field fails the build without side effects.
pub(crate) fn build(cache: &HandleCache, descriptor: &EntityDescriptor) -> CoreResult<usize> {
    let mut plain = Vec::new();
    for field in descriptor.secondary_keys().keys() {
        plain.push((field, descriptor.field_reader(field)?));
    }
    let mut foreign = Vec::new();
    for (field, declaration) in descriptor.foreign_keys() {
        foreign.push((field, declaration, descriptor.field_reader(field)?));
    }

    let primary = cache.primary_handle(descriptor.name())?;
    for (field, reader) in &plain {
        let secondary = cache.index_handle(descriptor, field)?;
        primary.associate(&secondary, extractor(reader))?;
        debug!(entity = descriptor.name(), field = field.as_str(), "secondary index ready");
    }
    for (field, declaration, reader) in &foreign {
        let parent = cache.primary_handle(&declaration.referenced)?;
        let secondary = cache.index_handle(descriptor, field)?;
        primary.associate(&secondary, extractor(reader))?;
        secondary.set_foreign(&parent, ForeignDeleteAction::Abort)?;
        debug!(
            entity = descriptor.name(),
            field = field.as_str(),
            parent = declaration.referenced.as_str(),
            "foreign key ready"
        );
    }
    Ok(plain.len() + foreign.len())
}

fn extractor(reader: &PayloadReader) -> KeyExtractor {
    let reader = Arc::clone(reader);
    Arc::new(move |_key: &[u8], payload: &[u8]| reader(payload))
}
