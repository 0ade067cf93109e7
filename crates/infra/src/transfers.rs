//! VIN-level vehicle tracking on top of the quantity ledger.
//!
//! Vehicles and transfer requests live in a [`VehicleStore`]; quantities only move
//! through the applier. A delivery applies its ledger entries as one unit of work
//! keyed by the request id, then moves the vehicles, so a failed delivery leaves
//! both untouched. The ledger step runs without holding the service lock; the
//! request is marked in flight meanwhile and re-checked before the vehicles move.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use stockledger_core::{DomainError, StaffId, TransactionId, VariantId};
use stockledger_inventory::{
    InventoryTransaction, PhysicalVehicle, StockScope, TransactionRequest, TransactionType, TransferRequest,
    TransferStatus, VehicleStatus, Vin,
};

use crate::applier::{ApplyError, TransactionApplier};
use crate::store::{StockStore, StoreError, VehicleStore};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DomainError> for TransferError {
    fn from(value: DomainError) -> Self {
        TransferError::Validation(value.to_string())
    }
}

#[derive(Debug)]
pub struct TransferService<S, V> {
    applier: Arc<TransactionApplier<S>>,
    vehicles: V,
    /// Serializes registry writes; holds the requests whose ledger step is running.
    in_flight: Mutex<HashSet<Uuid>>,
}

impl<S: StockStore, V: VehicleStore> TransferService<S, V> {
    pub fn new(applier: Arc<TransactionApplier<S>>, vehicles: V) -> Self {
        Self {
            applier,
            vehicles,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn vehicle(&self, vin: &Vin) -> Result<PhysicalVehicle, TransferError> {
        self.vehicles
            .load_vehicle(vin)?
            .ok_or_else(|| TransferError::NotFound(format!("vehicle {vin}")))
    }

    pub fn request(&self, id: Uuid) -> Result<TransferRequest, TransferError> {
        self.vehicles
            .load_request(id)?
            .ok_or_else(|| TransferError::NotFound(format!("transfer request {id}")))
    }

    /// Register vehicles arriving at the warehouse and restock their variant.
    pub fn receive_vehicles(
        &self,
        variant_id: VariantId,
        vins: Vec<Vin>,
        staff_id: StaffId,
    ) -> Result<(), TransferError> {
        let _guard = self.lock()?;
        if vins.is_empty() {
            return Err(TransferError::Validation("no vehicles to receive".to_string()));
        }
        for (i, vin) in vins.iter().enumerate() {
            if vins[..i].contains(vin) || self.vehicles.load_vehicle(vin)?.is_some() {
                return Err(TransferError::Validation(format!("vehicle {vin} is already registered")));
            }
        }

        let request = TransactionRequest::new(
            TransactionType::Restock,
            variant_id,
            vins.len() as i64,
            staff_id,
        )
        .with_notes(format!("received {} vehicle(s)", vins.len()));
        self.applier.apply(request)?;

        let now = Utc::now();
        let received: Vec<_> = vins
            .into_iter()
            .map(|vin| PhysicalVehicle::received(vin, variant_id, now))
            .collect();
        self.vehicles.save(&received, None)?;
        Ok(())
    }

    /// Open a PENDING transfer for vehicles in stock at `from`.
    pub fn request_transfer(
        &self,
        variant_id: VariantId,
        from: StockScope,
        to: StockScope,
        vins: Vec<Vin>,
        requested_by: StaffId,
    ) -> Result<TransferRequest, TransferError> {
        let _guard = self.lock()?;
        let request = TransferRequest::open(variant_id, from, to, vins, requested_by, Utc::now())?;

        for vin in &request.vins {
            let vehicle = self.vehicle(vin)?;
            if vehicle.variant_id() != variant_id
                || vehicle.location() != from
                || vehicle.status() != VehicleStatus::InStock
            {
                return Err(TransferError::Validation(format!(
                    "vehicle {vin} is not an in-stock unit of variant {variant_id} at {from}"
                )));
            }
            if self.vehicles.is_reserved(vin)? {
                return Err(TransferError::Validation(format!(
                    "vehicle {vin} is already part of an open transfer"
                )));
            }
        }

        self.vehicles.save(&[], Some(&request))?;
        info!(request_id = %request.request_id, variant_id = %variant_id, from = %from, to = %to, "transfer requested");
        Ok(request)
    }

    pub fn confirm(&self, id: Uuid) -> Result<TransferRequest, TransferError> {
        let _guard = self.lock()?;
        let mut request = self.request(id)?;
        request.advance(TransferStatus::Confirmed, Utc::now())?;
        self.vehicles.save(&[], Some(&request))?;
        Ok(request)
    }

    /// Vehicles leave their origin; quantities stay put until delivery.
    pub fn dispatch(&self, id: Uuid) -> Result<TransferRequest, TransferError> {
        let _guard = self.lock()?;
        let now = Utc::now();
        let mut request = self.request(id)?;
        request.advance(TransferStatus::InTransit, now)?;

        let mut moving = Vec::with_capacity(request.vins.len());
        for vin in &request.vins {
            let mut vehicle = self.vehicle(vin)?;
            vehicle.dispatch(request.from, now)?;
            moving.push(vehicle);
        }
        self.vehicles.save(&moving, Some(&request))?;
        Ok(request)
    }

    /// Apply the transfer's ledger entries, then land the vehicles at the destination.
    ///
    /// A delivery whose ledger entries were committed but whose vehicles were not
    /// saved can be retried: the entries are found by the request id and only the
    /// vehicles are moved.
    pub fn deliver(&self, id: Uuid, staff_id: StaffId) -> Result<TransferRequest, TransferError> {
        let request = {
            let mut in_flight = self.lock()?;
            if in_flight.contains(&id) {
                return Err(TransferError::Validation(format!(
                    "transfer request {id} is already being delivered"
                )));
            }
            let mut request = self.request(id)?;
            request.advance(TransferStatus::Delivered, Utc::now())?;
            in_flight.insert(id);
            request
        };

        let applied = self.apply_delivery(&request, staff_id);

        let mut in_flight = self.lock()?;
        in_flight.remove(&id);
        let transactions = applied?;

        let now = Utc::now();
        let mut request = self.request(id)?;
        request.advance(TransferStatus::Delivered, now)?;
        let mut landed = Vec::with_capacity(request.vins.len());
        for vin in &request.vins {
            let mut vehicle = self.vehicle(vin)?;
            vehicle.arrive(request.to, now)?;
            landed.push(vehicle);
        }
        self.vehicles.save(&landed, Some(&request))?;
        drop(in_flight);

        info!(
            request_id = %id,
            transactions = ?transactions,
            quantity = request.quantity(),
            "transfer delivered"
        );
        Ok(request)
    }

    /// Commit the ledger entries of a delivery unless an earlier attempt already did.
    fn apply_delivery(
        &self,
        request: &TransferRequest,
        staff_id: StaffId,
    ) -> Result<Vec<TransactionId>, TransferError> {
        let id = request.request_id;
        let reference = id.to_string();
        let ids = |entries: Vec<InventoryTransaction>| -> Vec<TransactionId> {
            entries.iter().map(|t| t.transaction_id).collect()
        };

        let existing = self.applier.store().ledger_by_reference(&reference)?;
        if !existing.is_empty() {
            info!(request_id = %id, "transfer ledger entries already applied; completing delivery");
            return Ok(ids(existing));
        }
        match self
            .applier
            .apply_batch(request.ledger_requests(staff_id), Some(format!("transfer:{id}")))
        {
            Ok(committed) => Ok(committed.transaction_ids()),
            Err(ApplyError::AlreadyApplied(_)) => Ok(ids(self.applier.store().ledger_by_reference(&reference)?)),
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel an open transfer; vehicles already in transit return to their origin.
    pub fn cancel(&self, id: Uuid) -> Result<TransferRequest, TransferError> {
        let in_flight = self.lock()?;
        if in_flight.contains(&id) {
            return Err(TransferError::Validation(format!(
                "transfer request {id} is being delivered"
            )));
        }
        let now = Utc::now();
        let mut request = self.request(id)?;
        let was_in_transit = request.status == TransferStatus::InTransit;
        request.cancel(now)?;

        let mut returning = Vec::new();
        if was_in_transit {
            for vin in &request.vins {
                let mut vehicle = self.vehicle(vin)?;
                vehicle.arrive(request.from, now)?;
                returning.push(vehicle);
            }
        }
        self.vehicles.save(&returning, Some(&request))?;
        Ok(request)
    }

    /// Record a customer sale of one vehicle held by a dealer.
    pub fn sell_vehicle(&self, vin: &Vin, staff_id: StaffId) -> Result<PhysicalVehicle, TransferError> {
        let _guard = self.lock()?;
        if self.vehicles.is_reserved(vin)? {
            return Err(TransferError::Validation(format!("vehicle {vin} is part of an open transfer")));
        }
        let mut vehicle = self.vehicle(vin)?;
        vehicle.sell(Utc::now())?;

        let StockScope::Dealer(dealer_id) = vehicle.location() else {
            return Err(TransferError::Validation(format!("vehicle {vin} is not at a dealer")));
        };
        let request = TransactionRequest::new(TransactionType::Sale, vehicle.variant_id(), 1, staff_id)
            .from_dealer(dealer_id)
            .with_reference(vin.as_str());
        self.applier.apply(request)?;

        self.vehicles.save(std::slice::from_ref(&vehicle), None)?;
        Ok(vehicle)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashSet<Uuid>>, TransferError> {
        self.in_flight
            .lock()
            .map_err(|_| TransferError::Store(StoreError::Backend("transfer lock poisoned".to_string())))
    }
}
