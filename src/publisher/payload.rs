use crate::directory::config::RelationshipDefaults;
use crate::directory::resources::{
    CreateResourceData, CreateResourceRequest, FormattedText, GeoField, Relationship,
    ResourceAttributes, ResourceRef,
};
use crate::models::{Listing, ListingKind};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

const LOCATION_TYPE: &str = "taxonomy_term--locations";
const PROPERTY_TYPE: &str = "taxonomy_term--property_types";
const LAND_TYPE: &str = "taxonomy_term--land_types";
const FEATURE_TYPE: &str = "taxonomy_term--features";
const FILE_TYPE: &str = "file--file";
const USER_TYPE: &str = "user--user";

/// Directory ids are hyphenated UUIDs; anything else is rejected upstream.
pub fn is_valid_relationship_id(id: &str) -> bool {
    id.len() == 36 && Uuid::try_parse(id).is_ok()
}

fn category_type(kind: ListingKind) -> &'static str {
    match kind {
        ListingKind::Property => PROPERTY_TYPE,
        ListingKind::Land => LAND_TYPE,
    }
}

/// Accumulates relationships for one create request, dropping malformed ids.
pub struct CreateRequestBuilder {
    resource_type: &'static str,
    attributes: ResourceAttributes,
    relationships: BTreeMap<&'static str, Relationship>,
}

impl CreateRequestBuilder {
    pub fn new(kind: ListingKind, attributes: ResourceAttributes) -> Self {
        Self {
            resource_type: kind.resource_type(),
            attributes,
            relationships: BTreeMap::new(),
        }
    }

    /// Sets a to-one relationship, trying `candidate` then `fallback`.
    pub fn single(
        mut self,
        field: &'static str,
        resource_type: &'static str,
        candidate: Option<&str>,
        fallback: Option<&str>,
    ) -> Self {
        let chosen = candidate
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .filter(|id| keep_id(field, id))
            .or_else(|| fallback.filter(|id| keep_id(field, id)));
        if let Some(id) = chosen {
            self.relationships
                .insert(field, Relationship::one(ResourceRef::new(resource_type, id)));
        }
        self
    }

    /// Sets a to-many relationship; omitted when nothing valid remains.
    pub fn many<'a>(
        mut self,
        field: &'static str,
        resource_type: &'static str,
        ids: impl IntoIterator<Item = &'a str>,
        validate: bool,
    ) -> Self {
        let refs: Vec<ResourceRef> = ids
            .into_iter()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .filter(|id| !validate || keep_id(field, id))
            .map(|id| ResourceRef::new(resource_type, id))
            .collect();
        if !refs.is_empty() {
            self.relationships.insert(field, Relationship::many(refs));
        }
        self
    }

    pub fn build(self) -> CreateResourceRequest {
        CreateResourceRequest {
            data: CreateResourceData {
                resource_type: self.resource_type,
                attributes: self.attributes,
                relationships: self.relationships,
            },
        }
    }
}

fn keep_id(field: &str, id: &str) -> bool {
    let valid = is_valid_relationship_id(id);
    if !valid {
        warn!(
            target = "realty.publisher",
            field = field,
            id = id,
            "relationship_id_dropped"
        );
    }
    valid
}

pub fn attributes_for(listing: &Listing, reference_id: &str) -> ResourceAttributes {
    let is_land = listing.kind == ListingKind::Land;
    let body = Some(listing.description.trim())
        .filter(|d| !d.is_empty())
        .map(|value| FormattedText {
            value: value.to_string(),
            format: "basic_html",
        });
    ResourceAttributes {
        title: listing.title.clone(),
        body,
        field_deal_type: listing.deal.as_str(),
        field_reference_id: reference_id.to_string(),
        field_price: listing.price.map(|p| format!("{p:.2}")),
        field_currency: listing.price.map(|_| listing.currency.clone()),
        field_bedrooms: listing.bedrooms.filter(|_| !is_land),
        field_bathrooms: listing.bathrooms.filter(|_| !is_land),
        field_covered_area: listing.covered_area.filter(|_| !is_land),
        field_plot_area: listing.plot_area,
        field_address: listing.address.clone(),
        field_geo: listing.geo.as_ref().map(|g| GeoField {
            lat: g.lat,
            lng: g.lng,
        }),
    }
}

/// Assembles the JSON:API create document for `listing`.
pub fn build_create_request(
    listing: &Listing,
    reference_id: &str,
    asset_ids: &[String],
    reviewer_id: &str,
    defaults: &RelationshipDefaults,
) -> CreateResourceRequest {
    let refs = &listing.relationships;
    CreateRequestBuilder::new(listing.kind, attributes_for(listing, reference_id))
        .single(
            "field_location",
            LOCATION_TYPE,
            refs.location_id.as_deref(),
            Some(defaults.location_id.as_str()),
        )
        .single(
            "field_category",
            category_type(listing.kind),
            refs.category_id.as_deref(),
            Some(defaults.category_for(listing.kind)),
        )
        .many(
            "field_features",
            FEATURE_TYPE,
            refs.feature_ids.iter().map(String::as_str),
            true,
        )
        .many(
            "field_images",
            FILE_TYPE,
            asset_ids.iter().map(String::as_str),
            false,
        )
        .single(
            "field_reviewer",
            USER_TYPE,
            Some(reviewer_id),
            Some(defaults.reviewer_id.as_str()),
        )
        .build()
}
